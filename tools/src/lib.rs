extern crate log;

pub mod sim;
pub mod table_file;

use std::fmt;

use softusb::host::{TransferError, MAX_SKEW_PPM};
use softusb::SoftUsbError;

#[derive(Debug)]
pub enum SimError {
    /// the table file could not be read
    Io(std::io::Error),
    /// the table file is not valid JSON for a descriptor table
    Json(serde_json::Error),
    /// the device refused its configuration or descriptor table
    Device(SoftUsbError),
    /// enumeration failed on the bus
    Transfer(TransferError),
    /// a command line value did not parse
    BadArgument(String),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Io(e) => write!(f, "I/O error: {}", e),
            SimError::Json(e) => write!(f, "table file: {}", e),
            SimError::Device(e) => write!(f, "{}", e),
            SimError::Transfer(e) => write!(f, "enumeration failed: {}", e),
            SimError::BadArgument(why) => write!(f, "bad argument: {}", why),
        }
    }
}

impl std::error::Error for SimError {}

impl From<std::io::Error> for SimError {
    fn from(e: std::io::Error) -> Self { SimError::Io(e) }
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self { SimError::Json(e) }
}

impl From<SoftUsbError> for SimError {
    fn from(e: SoftUsbError) -> Self { SimError::Device(e) }
}

impl From<softusb::DescriptorError> for SimError {
    fn from(e: softusb::DescriptorError) -> Self { SimError::Device(e.into()) }
}

impl From<TransferError> for SimError {
    fn from(e: TransferError) -> Self { SimError::Transfer(e) }
}

/// Accepts decimal or 0x-prefixed hex.
pub fn parse_u32(s: &str) -> Result<u32, SimError> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|_| SimError::BadArgument(format!("not a number: {}", s)))
}

/// Host clock error in ppm, within what the host model accepts.
pub fn parse_skew(s: &str) -> Result<i32, SimError> {
    match s.parse::<i32>() {
        Ok(ppm) if (-MAX_SKEW_PPM..=MAX_SKEW_PPM).contains(&ppm) => Ok(ppm),
        _ => Err(SimError::BadArgument(format!("skew must be -{0}..={0} ppm, not {1}", MAX_SKEW_PPM, s))),
    }
}

/// Eight bytes of hex, with or without separators: "0000040000000000" or "00:00:04:00:00:00:00:00".
pub fn parse_report(s: &str) -> Result<[u8; 8], SimError> {
    let digits: Vec<char> = s.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if digits.len() != 16 || s.chars().any(|c| !c.is_ascii_hexdigit() && c != ':' && c != ' ') {
        return Err(SimError::BadArgument(format!("report must be 8 hex bytes: {}", s)));
    }
    let mut report = [0u8; 8];
    for (byte, pair) in report.iter_mut().zip(digits.chunks(2)) {
        let text: String = pair.iter().collect();
        *byte = u8::from_str_radix(&text, 16).map_err(|_| SimError::BadArgument(text.clone()))?;
    }
    Ok(report)
}
