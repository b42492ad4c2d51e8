use usb_device::control::Request;
use usb_device::descriptor::descriptor_type;

use super::*;
use crate::host::{get_descriptor, standard_write, TransferError};
use crate::packet::{Handshake, Packet, SetupPacket};
use crate::control::ControlState;
use crate::rx::RxState;
use crate::tx::TxState;
use crate::CONTROL_ENDPOINT;

/// Runs a control read by hand and returns the size of every data packet.
fn packet_sizes(host: &mut HostModel, device: &mut Device, address: u8, setup: &SetupPacket) -> Vec<usize> {
    host.setup(device, address, setup).unwrap();
    let mut sizes = Vec::new();
    let mut total = 0;
    loop {
        let chunk = host.read_packet(device, address, CONTROL_ENDPOINT).unwrap();
        sizes.push(chunk.len());
        total += chunk.len();
        if chunk.len() < 8 || total >= setup.length as usize {
            break;
        }
    }
    host.write_packet(device, address, CONTROL_ENDPOINT, crate::packet::DataToggle::Data1, &[]).unwrap();
    sizes
}

fn check_enumeration(speed: Speed, skew_ppm: i32) {
    let (mut device, host) = bench(speed, InjectionPolicy::default());
    let mut host = host.with_skew_ppm(skew_ppm).unwrap();
    let table = DescriptorTable::boot_keyboard();

    let found = host.enumerate(&mut device, 5).unwrap();
    assert_eq!(found.device, table.device());
    assert_eq!(found.configuration, table.configuration());
    assert_eq!(found.languages, table.string(0).unwrap());
    assert_eq!(found.report_descriptor, table.hid_report());

    assert_eq!(device.address(), 5);
    assert!(device.configured());
    assert_eq!(device.mode(), 0x20);
    assert_eq!(drain(&mut device), vec![PortEvent::ModeChanged(0x20), PortEvent::Configured(true)]);
    assert_eq!(host.collisions(), 0);
    let stats = device.stats();
    assert_eq!(stats.crc_failures, 0);
    assert_eq!(stats.stalls, 0);
    assert_eq!(stats.bus_resets, 1);
}

#[test]
fn test_enumeration_low_speed() { check_enumeration(Speed::Low, 0); }

#[test]
fn test_enumeration_full_speed() { check_enumeration(Speed::Full, 0); }

#[test]
fn test_enumeration_with_host_clock_skew() {
    check_enumeration(Speed::Low, 15_000);
    check_enumeration(Speed::Low, -15_000);
}

#[test]
fn test_host_skew_is_bounded() {
    let (mut device, host) = bench(Speed::Low, InjectionPolicy::default());
    for ppm in [-1_000_000, i32::MIN, crate::host::MAX_SKEW_PPM + 1].iter() {
        let refused = host.clone().with_skew_ppm(*ppm);
        assert!(matches!(refused, Err(crate::SoftUsbError::InvalidConfig(_))), "{} ppm", ppm);
    }
    let mut slow = host.with_skew_ppm(-crate::host::MAX_SKEW_PPM).unwrap();
    slow.idle(&mut device, 4);
    assert_eq!(device.stats(), crate::EngineStats::default());
}

#[test]
fn test_device_descriptor_packetization() {
    let (mut device, mut host) = bench(Speed::Low, InjectionPolicy::default());
    host.bus_reset(&mut device);
    let cases: [(u16, &[usize]); 5] =
        [(8, &[8]), (9, &[8, 1]), (16, &[8, 8]), (18, &[8, 8, 2]), (64, &[8, 8, 2])];
    for &(length, sizes) in cases.iter() {
        let setup = get_descriptor(descriptor_type::DEVICE, 0, length);
        assert_eq!(packet_sizes(&mut host, &mut device, 0, &setup), sizes, "wLength {}", length);
    }
    // "softusb" is 16 bytes long, so a long read ends with a zero-length packet
    let setup = get_descriptor(descriptor_type::STRING, 1, 255);
    assert_eq!(packet_sizes(&mut host, &mut device, 0, &setup), vec![8, 8, 0]);
}

#[test]
fn test_set_address_gates_tokens() {
    let (mut device, mut host) = bench(Speed::Low, InjectionPolicy::default());
    host.bus_reset(&mut device);
    host.setup(&mut device, 0, &standard_write(Request::SET_ADDRESS, 5)).unwrap();
    let (_, status) = host.in_transaction(&mut device, 0, CONTROL_ENDPOINT, false).unwrap();
    assert!(status.is_empty());
    // the new address only takes effect once the status stage is acknowledged
    assert_eq!(device.address(), 0);
    host.send(&mut device, &Packet::Handshake(Handshake::Ack));
    host.idle(&mut device, 4);
    assert_eq!(device.address(), 5);

    let setup = get_descriptor(descriptor_type::DEVICE, 0, 18);
    assert_eq!(host.control_read(&mut device, 5, &setup).unwrap().len(), 18);
    let rejected = device.stats().tokens_rejected;
    assert_eq!(host.control_read(&mut device, 0, &setup), Err(TransferError::Timeout));
    assert!(device.stats().tokens_rejected > rejected);

    // the interrupt endpoint of address 0 still gets through the gate: NAK while unconfigured
    assert_eq!(host.poll_interrupt(&mut device, 0), Err(TransferError::Nak));
}

#[test]
fn test_bus_reset_returns_to_default_state() {
    let (mut device, mut host) = enumerated(InjectionPolicy::default(), 9);
    let vendor = SetupPacket { request_type: 0xC0, request: 0x42, value: 0, index: 0, length: 4 };
    assert_eq!(host.control_read(&mut device, 9, &vendor), Err(TransferError::Stall));
    assert_eq!(device.control_state(), ControlState::Stall);

    host.bus_reset(&mut device);
    assert_eq!(device.control_state(), ControlState::WaitEvent);
    assert_eq!(device.tx_state(), TxState::WaitRequest);
    assert_eq!(device.rx_state(), RxState::Idle);
    assert!(!device.driving());
    assert_eq!(device.address(), 0);
    assert!(!device.configured());
    assert_eq!(device.mode(), 0);
    assert_eq!(drain(&mut device), vec![PortEvent::Configured(false), PortEvent::ModeChanged(0)]);
    assert_eq!(device.stats().bus_resets, 2);

    let setup = get_descriptor(descriptor_type::DEVICE, 0, 18);
    assert_eq!(host.control_read(&mut device, 0, &setup).unwrap().len(), 18);
    assert_eq!(host.control_read(&mut device, 9, &setup), Err(TransferError::Timeout));
}

#[test]
fn test_start_of_frame_is_ignored() {
    let (mut device, mut host) = enumerated(InjectionPolicy::default(), 3);
    let before = device.stats();
    for _ in 0..4 {
        host.start_of_frame(&mut device);
    }
    assert_eq!(device.stats(), before);
    assert_eq!(host.poll_interrupt(&mut device, 3), Ok(KEY_A.to_vec()));
}
