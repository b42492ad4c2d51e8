//! Packet identifiers, packet framing and SETUP request layout.

use std::fmt;

use bitfield::bitfield;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use usb_device::control::{Recipient, RequestType};
use usb_device::UsbDirection;

use crate::crc16::{crc16_generate, Crc16};

/// SYNC as it comes off the NRZI decoder, LSB first: seven zeros then a one.
pub const SYNC_BYTE: u8 = 0x80;

/// 4-bit packet identifiers. On the wire the PID is followed by its complement.
#[derive(FromPrimitive, ToPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pid {
    Out = 0b0001,
    In = 0b1001,
    Sof = 0b0101,
    Setup = 0b1101,
    Data0 = 0b0011,
    Data1 = 0b1011,
    Ack = 0b0010,
    Nak = 0b1010,
    Stall = 0b1110,
    Pre = 0b1100,
}

impl Pid {
    pub fn byte(self) -> u8 {
        let pid = self as u8;
        pid | ((!pid & 0xF) << 4)
    }

    /// Checks the complement nibble, then maps the identifier.
    pub fn from_byte(byte: u8) -> Result<Pid, PacketError> {
        if (byte >> 4) != (!byte & 0xF) {
            return Err(PacketError::PidCheck);
        }
        Pid::from_u8(byte & 0xF).ok_or(PacketError::UnknownPid)
    }

    pub fn is_token(self) -> bool { matches!(self, Pid::Out | Pid::In | Pid::Setup | Pid::Sof) }

    pub fn is_data(self) -> bool { matches!(self, Pid::Data0 | Pid::Data1) }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Handshake {
    Ack,
    Nak,
    Stall,
}

impl Handshake {
    pub fn pid(self) -> Pid {
        match self {
            Handshake::Ack => Pid::Ack,
            Handshake::Nak => Pid::Nak,
            Handshake::Stall => Pid::Stall,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataToggle {
    Data0,
    Data1,
}

impl DataToggle {
    pub fn toggled(self) -> DataToggle {
        match self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        }
    }

    pub fn pid(self) -> Pid {
        match self {
            DataToggle::Data0 => Pid::Data0,
            DataToggle::Data1 => Pid::Data1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Out,
    In,
    Setup,
}

impl TokenKind {
    pub fn pid(self) -> Pid {
        match self {
            TokenKind::Out => Pid::Out,
            TokenKind::In => Pid::In,
            TokenKind::Setup => Pid::Setup,
        }
    }
}

bitfield! {
    /// The 16 bits following a token PID, LSB first on the wire.
    pub struct TokenFields(u16);
    impl Debug;
    pub u8, address, set_address: 6, 0;
    pub u8, endpoint, set_endpoint: 10, 7;
    pub u8, crc5, set_crc5: 15, 11;
}

impl TokenFields {
    pub fn new(address: u8, endpoint: u8) -> Self {
        let mut fields = TokenFields(0);
        fields.set_address(address & 0x7F);
        fields.set_endpoint(endpoint & 0xF);
        fields.set_crc5(crc5(fields.0 as u32 & 0x7FF, 11));
        fields
    }

    pub fn crc5_ok(&self) -> bool { crc5(self.0 as u32 & 0x7FF, 11) == self.crc5() }
}

/// USB CRC5 over the low `bits` bits of `data`, LSB first, already inverted.
pub fn crc5(data: u32, bits: u32) -> u8 {
    let mut reg: u8 = 0x1F;
    for i in 0..bits {
        let bit = (data >> i) & 1 == 1;
        if (reg & 1 == 1) ^ bit {
            reg = (reg >> 1) ^ 0x14;
        } else {
            reg >>= 1;
        }
    }
    !reg & 0x1F
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// fewer bits than the PID class requires
    TooShort,
    /// the packet did not start with the SYNC pattern
    BadSync,
    /// PID nibble does not match its complement
    PidCheck,
    /// well-formed PID nibble with no assigned meaning
    UnknownPid,
    /// CRC5 or CRC16 did not verify
    Crc,
    /// data stage not a whole number of bytes, or longer than a packet can carry
    BadLength,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::TooShort => write!(f, "packet too short"),
            PacketError::BadSync => write!(f, "bad SYNC pattern"),
            PacketError::PidCheck => write!(f, "PID check bits mismatch"),
            PacketError::UnknownPid => write!(f, "unknown PID"),
            PacketError::Crc => write!(f, "CRC mismatch"),
            PacketError::BadLength => write!(f, "bad data length"),
        }
    }
}

/// Largest data payload this crate will frame or accept from the host model.
pub const MAX_DATA_PAYLOAD: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Token { kind: TokenKind, address: u8, endpoint: u8 },
    Sof { frame: u16 },
    Data { toggle: DataToggle, payload: Vec<u8> },
    Handshake(Handshake),
}

pub(crate) fn push_bits(bits: &mut Vec<bool>, value: u32, count: u32) {
    for i in 0..count {
        bits.push((value >> i) & 1 == 1);
    }
}

pub(crate) fn read_bits(bits: &[bool], start: usize, count: usize) -> u32 {
    bits[start..start + count].iter().enumerate().fold(0, |acc, (i, &b)| acc | ((b as u32) << i))
}

impl Packet {
    pub fn pid(&self) -> Pid {
        match self {
            Packet::Token { kind, .. } => kind.pid(),
            Packet::Sof { .. } => Pid::Sof,
            Packet::Data { toggle, .. } => toggle.pid(),
            Packet::Handshake(h) => h.pid(),
        }
    }

    /// SYNC, PID and body with CRC, before bit stuffing.
    pub fn to_bits(&self) -> Vec<bool> {
        let mut bits = Vec::with_capacity(32);
        push_bits(&mut bits, SYNC_BYTE as u32, 8);
        push_bits(&mut bits, self.pid().byte() as u32, 8);
        match self {
            Packet::Token { address, endpoint, .. } => {
                push_bits(&mut bits, TokenFields::new(*address, *endpoint).0 as u32, 16);
            }
            Packet::Sof { frame } => {
                let frame = *frame as u32 & 0x7FF;
                push_bits(&mut bits, frame, 11);
                push_bits(&mut bits, crc5(frame, 11) as u32, 5);
            }
            Packet::Data { payload, .. } => {
                for &b in payload {
                    push_bits(&mut bits, b as u32, 8);
                }
                push_bits(&mut bits, crc16_generate(payload) as u32, 16);
            }
            Packet::Handshake(_) => {}
        }
        bits
    }

    /// Parses destuffed bits starting with SYNC. Tokens are CRC5-checked here even though
    /// the device's own receive path only checks the PID complement.
    pub fn from_bits(bits: &[bool]) -> Result<Packet, PacketError> {
        if bits.len() < 16 {
            return Err(PacketError::TooShort);
        }
        if read_bits(bits, 0, 8) as u8 != SYNC_BYTE {
            return Err(PacketError::BadSync);
        }
        let pid = Pid::from_byte(read_bits(bits, 8, 8) as u8)?;
        let body = &bits[16..];
        match pid {
            Pid::Out | Pid::In | Pid::Setup => {
                if body.len() < 16 {
                    return Err(PacketError::TooShort);
                }
                let fields = TokenFields(read_bits(body, 0, 16) as u16);
                if !fields.crc5_ok() {
                    return Err(PacketError::Crc);
                }
                let kind = match pid {
                    Pid::Out => TokenKind::Out,
                    Pid::In => TokenKind::In,
                    _ => TokenKind::Setup,
                };
                Ok(Packet::Token { kind, address: fields.address(), endpoint: fields.endpoint() })
            }
            Pid::Sof => {
                if body.len() < 16 {
                    return Err(PacketError::TooShort);
                }
                let frame = read_bits(body, 0, 11);
                if crc5(frame, 11) as u32 != read_bits(body, 11, 5) {
                    return Err(PacketError::Crc);
                }
                Ok(Packet::Sof { frame: frame as u16 })
            }
            Pid::Data0 | Pid::Data1 => {
                if body.len() < 16 {
                    return Err(PacketError::TooShort);
                }
                if body.len() % 8 != 0 || body.len() / 8 - 2 > MAX_DATA_PAYLOAD {
                    return Err(PacketError::BadLength);
                }
                let mut crc = Crc16::new();
                let bytes: Vec<u8> = body.chunks(8).map(|c| read_bits(c, 0, 8) as u8).collect();
                bytes.iter().for_each(|&b| crc.update_byte(b));
                if !crc.is_residual() {
                    return Err(PacketError::Crc);
                }
                let toggle = if pid == Pid::Data0 { DataToggle::Data0 } else { DataToggle::Data1 };
                Ok(Packet::Data { toggle, payload: bytes[..bytes.len() - 2].to_vec() })
            }
            Pid::Ack => Ok(Packet::Handshake(Handshake::Ack)),
            Pid::Nak => Ok(Packet::Handshake(Handshake::Nak)),
            Pid::Stall => Ok(Packet::Handshake(Handshake::Stall)),
            Pid::Pre => Err(PacketError::UnknownPid),
        }
    }
}

/// The eight bytes of a SETUP data stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn from_bytes(buf: &[u8; 8]) -> Self {
        SetupPacket {
            request_type: buf[0],
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let v = self.value.to_le_bytes();
        let i = self.index.to_le_bytes();
        let l = self.length.to_le_bytes();
        [self.request_type, self.request, v[0], v[1], i[0], i[1], l[0], l[1]]
    }

    pub fn direction(&self) -> UsbDirection {
        if self.request_type & 0x80 != 0 { UsbDirection::In } else { UsbDirection::Out }
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0x3 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Descriptor type or report type, carried in the high byte of wValue.
    pub fn value_high(&self) -> u8 { (self.value >> 8) as u8 }

    pub fn value_low(&self) -> u8 { self.value as u8 }
}
