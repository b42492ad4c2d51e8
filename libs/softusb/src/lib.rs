//! Bit-level USB Low-Speed/Full-Speed HID device.
//!
//! The whole device is clocked from a single reference tick: [`device::Device::tick`] takes the
//! current level of the D+/D- pair and returns what the device drives, if anything. Clock
//! recovery, NRZI coding, packet framing, the control-transfer state machine and the HID
//! endpoint all advance from that one call.
//!
//! Traffic on the bus that is addressed to a different device is handled according to an
//! [`policy::InjectionPolicy`]: polls of another device's interrupt endpoint can be answered with
//! a NAK, left alone, or answered with this device's own input report.

use std::fmt;

pub mod control;
pub mod crc16;
pub mod descriptors;
pub mod device;
pub mod host;
pub mod line;
pub mod packet;
pub mod policy;
pub mod port;
pub mod rx;
pub mod tx;

#[cfg(test)]
mod bus_tests;

pub use descriptors::{DescriptorError, DescriptorTable};
pub use device::{Device, DeviceConfig};
pub use line::{DiffPair, LineState, Speed};
pub use policy::InjectionPolicy;
pub use port::PortEvent;

pub const CONTROL_ENDPOINT: u8 = 0;
/// The only non-control endpoint, IN direction, polled by the host for reports.
pub const INTERRUPT_ENDPOINT: u8 = 1;
/// bMaxPacketSize0 and the interrupt endpoint's wMaxPacketSize.
pub const MAX_PACKET: usize = 8;

#[derive(Debug)]
pub enum SoftUsbError {
    /// the device configuration cannot work, with a description of why
    InvalidConfig(&'static str),
    /// a supplied descriptor table failed validation
    Descriptor(DescriptorError),
}

impl fmt::Display for SoftUsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SoftUsbError::InvalidConfig(why) => write!(f, "invalid device configuration: {}", why),
            SoftUsbError::Descriptor(e) => write!(f, "invalid descriptor table: {}", e),
        }
    }
}

impl std::error::Error for SoftUsbError {}

impl From<DescriptorError> for SoftUsbError {
    fn from(e: DescriptorError) -> Self { SoftUsbError::Descriptor(e) }
}

/// Running counters, never reset except by constructing a new device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineStats {
    pub tokens_accepted: u32,
    pub tokens_rejected: u32,
    /// data packets dropped for a bad CRC16 or bad length
    pub crc_failures: u32,
    pub stalls: u32,
    pub naks: u32,
    pub data_sent: u32,
    /// data packets withdrawn by the send-time gate
    pub sends_suppressed: u32,
    pub bus_resets: u32,
}
