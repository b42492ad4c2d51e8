//! Descriptor blobs served to the host.
//!
//! Tables are built once and never change while the device runs. [`DescriptorTable::new`] checks
//! the headers the control engine relies on, so a table that constructs is safe to serve.

use std::fmt;

use usb_device::descriptor::descriptor_type;

pub const HID_CLASS_DESCRIPTOR: u8 = 0x21;
pub const HID_REPORT_DESCRIPTOR: u8 = 0x22;

const DEVICE_DESCRIPTOR_LEN: usize = 18;
const CONFIGURATION_HEADER_LEN: usize = 9;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// bLength disagrees with the blob, or the blob is too short for its type
    BadLength(&'static str),
    /// bDescriptorType is not what the slot requires
    BadType(&'static str),
    /// wTotalLength of the configuration descriptor is not the blob length
    TotalLengthMismatch { declared: u16, actual: usize },
    /// bMaxPacketSize0 must match the 8-byte control endpoint
    MaxPacketSize(u8),
    /// string index 0 has to be present
    MissingLanguageTable,
    /// string indices are one byte on the wire
    TooManyStrings(usize),
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorError::BadLength(which) => write!(f, "{} descriptor has a bad length", which),
            DescriptorError::BadType(which) => write!(f, "{} descriptor has the wrong type", which),
            DescriptorError::TotalLengthMismatch { declared, actual } => {
                write!(f, "configuration wTotalLength is {} but {} bytes were supplied", declared, actual)
            }
            DescriptorError::MaxPacketSize(size) => write!(f, "bMaxPacketSize0 is {}, must be 8", size),
            DescriptorError::MissingLanguageTable => write!(f, "string descriptor 0 (languages) is missing"),
            DescriptorError::TooManyStrings(n) => write!(f, "{} string descriptors, at most 256 allowed", n),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorTable {
    device: Vec<u8>,
    configuration: Vec<u8>,
    strings: Vec<Vec<u8>>,
    hid_report: Vec<u8>,
}

impl DescriptorTable {
    /// `strings[0]` is the language table; every other entry is served at its index.
    pub fn new(
        device: Vec<u8>,
        configuration: Vec<u8>,
        strings: Vec<Vec<u8>>,
        hid_report: Vec<u8>,
    ) -> Result<Self, DescriptorError> {
        if device.len() != DEVICE_DESCRIPTOR_LEN || device[0] as usize != DEVICE_DESCRIPTOR_LEN {
            return Err(DescriptorError::BadLength("device"));
        }
        if device[1] != descriptor_type::DEVICE {
            return Err(DescriptorError::BadType("device"));
        }
        if device[7] as usize != crate::MAX_PACKET {
            return Err(DescriptorError::MaxPacketSize(device[7]));
        }

        if configuration.len() < CONFIGURATION_HEADER_LEN
            || configuration[0] as usize != CONFIGURATION_HEADER_LEN
        {
            return Err(DescriptorError::BadLength("configuration"));
        }
        if configuration[1] != descriptor_type::CONFIGURATION {
            return Err(DescriptorError::BadType("configuration"));
        }
        let declared = u16::from_le_bytes([configuration[2], configuration[3]]);
        if declared as usize != configuration.len() {
            return Err(DescriptorError::TotalLengthMismatch { declared, actual: configuration.len() });
        }

        if strings.is_empty() {
            return Err(DescriptorError::MissingLanguageTable);
        }
        if strings.len() > 256 {
            return Err(DescriptorError::TooManyStrings(strings.len()));
        }
        for s in strings.iter() {
            if s.len() < 2 || s[0] as usize != s.len() {
                return Err(DescriptorError::BadLength("string"));
            }
            if s[1] != descriptor_type::STRING {
                return Err(DescriptorError::BadType("string"));
            }
        }

        if hid_report.is_empty() {
            return Err(DescriptorError::BadLength("HID report"));
        }

        Ok(DescriptorTable { device, configuration, strings, hid_report })
    }

    /// A US-English boot keyboard with one interrupt IN endpoint polled every 10 ms.
    pub fn boot_keyboard() -> Self {
        let hid_report = BOOT_KEYBOARD_REPORT.to_vec();
        let mut configuration = BOOT_KEYBOARD_CONFIGURATION.to_vec();
        // wDescriptorLength of the report descriptor inside the HID class descriptor
        configuration[25..27].copy_from_slice(&(hid_report.len() as u16).to_le_bytes());
        DescriptorTable {
            device: BOOT_KEYBOARD_DEVICE.to_vec(),
            configuration,
            strings: vec![
                vec![4, descriptor_type::STRING, 0x09, 0x04],
                string_descriptor("softusb"),
                string_descriptor("HID Keyboard"),
            ],
            hid_report,
        }
    }

    pub fn device(&self) -> &[u8] { &self.device }

    pub fn configuration(&self) -> &[u8] { &self.configuration }

    pub fn string(&self, index: u8) -> Option<&[u8]> {
        self.strings.get(index as usize).map(|s| s.as_slice())
    }

    pub fn hid_report(&self) -> &[u8] { &self.hid_report }

    /// The HID class descriptor embedded in the configuration blob, if there is one.
    pub fn hid_class(&self) -> Option<&[u8]> {
        let mut offset = 0;
        while offset + 2 <= self.configuration.len() {
            let len = self.configuration[offset] as usize;
            if len < 2 || offset + len > self.configuration.len() {
                return None;
            }
            if self.configuration[offset + 1] == HID_CLASS_DESCRIPTOR {
                return Some(&self.configuration[offset..offset + len]);
            }
            offset += len;
        }
        None
    }

    /// bit 6 of bmAttributes
    pub fn self_powered(&self) -> bool { self.configuration[7] & 0x40 != 0 }
}

impl Default for DescriptorTable {
    fn default() -> Self { Self::boot_keyboard() }
}

/// Builds a string descriptor: bLength, type 3, then UTF-16LE code units.
pub fn string_descriptor(s: &str) -> Vec<u8> {
    let mut out = vec![0, descriptor_type::STRING];
    for unit in s.encode_utf16().take(126) {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
    out
}

#[rustfmt::skip]
const BOOT_KEYBOARD_DEVICE: [u8; 18] = [
    0x12, 0x01, 0x10, 0x01, // USB 1.1
    0x00, 0x00, 0x00,       // class defined per interface
    0x08,                   // bMaxPacketSize0
    0x09, 0x12, 0x01, 0x00, // pid.codes test VID/PID
    0x00, 0x01,             // bcdDevice
    0x01, 0x02, 0x00,       // manufacturer, product, no serial
    0x01,                   // one configuration
];

#[rustfmt::skip]
const BOOT_KEYBOARD_CONFIGURATION: [u8; 34] = [
    // configuration 1, bus powered, remote wakeup, 100 mA
    0x09, 0x02, 0x22, 0x00, 0x01, 0x01, 0x00, 0xA0, 0x32,
    // interface 0: HID, boot subclass, keyboard protocol
    0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00,
    // HID 1.11, one report descriptor; length patched in
    0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x00, 0x00,
    // endpoint 1 IN, interrupt, 8 bytes, 10 ms
    0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A,
];

#[rustfmt::skip]
const BOOT_KEYBOARD_REPORT: [u8; 63] = [
    0x05, 0x01, 0x09, 0x06, 0xA1, 0x01,
    // modifiers
    0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, 0x15, 0x00, 0x25, 0x01, 0x75, 0x01, 0x95, 0x08, 0x81, 0x02,
    // reserved byte
    0x95, 0x01, 0x75, 0x08, 0x81, 0x01,
    // LED output report
    0x95, 0x05, 0x75, 0x01, 0x05, 0x08, 0x19, 0x01, 0x29, 0x05, 0x91, 0x02,
    0x95, 0x01, 0x75, 0x03, 0x91, 0x01,
    // six key codes
    0x95, 0x06, 0x75, 0x08, 0x15, 0x00, 0x25, 0x65, 0x05, 0x07, 0x19, 0x00, 0x29, 0x65, 0x81, 0x00,
    0xC0,
];
