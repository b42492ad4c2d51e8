//! Whole-device scenarios, driven through the host model at line level.

mod enumeration;
mod injection;
mod stall;

use crate::descriptors::DescriptorTable;
use crate::device::{Device, DeviceConfig};
use crate::host::HostModel;
use crate::line::Speed;
use crate::policy::InjectionPolicy;
use crate::port::PortEvent;

/// Boot keyboard report with the "a" key down.
pub(crate) const KEY_A: [u8; 8] = [0, 0, 0x04, 0, 0, 0, 0, 0];

pub(crate) fn bench(speed: Speed, policy: InjectionPolicy) -> (Device, HostModel) {
    let config = DeviceConfig { speed, policy, ..Default::default() };
    let device = Device::new(config, DescriptorTable::boot_keyboard()).unwrap();
    (device, HostModel::for_device(&config))
}

/// A low-speed keyboard enumerated at `address`, with its event queue drained.
pub(crate) fn enumerated(policy: InjectionPolicy, address: u8) -> (Device, HostModel) {
    let (mut device, mut host) = bench(Speed::Low, policy);
    host.enumerate(&mut device, address).unwrap();
    device.set_input_report(KEY_A);
    drain(&mut device);
    (device, host)
}

pub(crate) fn drain(device: &mut Device) -> Vec<PortEvent> {
    std::iter::from_fn(|| device.poll_event()).collect()
}
