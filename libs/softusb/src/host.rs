//! A USB host at the waveform level.
//!
//! The host shares the device's reference clock: every call into the model advances the device
//! by whole ticks, with the host's bit cells laid out on that tick grid. Packets go out with real
//! CRCs, bit stuffing, NRZI and EOP; replies are recovered with a separate [`LineCodec`], so the
//! device is only ever judged by what it put on the wires.

use std::fmt;

use usb_device::control::Request;
use usb_device::descriptor::descriptor_type;

use crate::descriptors::HID_REPORT_DESCRIPTOR;
use crate::device::{Device, DeviceConfig};
use crate::line::{bit_stuff, nrzi_encode, ClockEdge, LineCodec, LineState, Speed};
use crate::packet::{DataToggle, Handshake, Packet, PacketError, Pid, SetupPacket, TokenKind};
use crate::{SoftUsbError, CONTROL_ENDPOINT, INTERRUPT_ENDPOINT, MAX_PACKET};

/// Largest host bit clock error accepted, either way. Real hosts stay within a few thousand.
pub const MAX_SKEW_PPM: i32 = 100_000;
/// Bit-times the host waits for the start of a reply.
pub const RESPONSE_TIMEOUT_BITS: u32 = 16;
/// Idle bit-times between the packets of a transaction and between transactions.
const INTER_PACKET_BITS: u32 = 2;
/// Longest reply worth decoding: a full data packet with room for stuffing.
const MAX_REPLY_BITS: usize = 16 + (MAX_PACKET + 2) * 8 + 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// the device answered STALL
    Stall,
    /// nothing came back within the response timeout
    Timeout,
    /// the device answered NAK
    Nak,
    /// a reply came back but did not decode
    Malformed(PacketError),
    /// a well-formed reply of the wrong kind
    UnexpectedPid(Pid),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Stall => write!(f, "STALL"),
            TransferError::Timeout => write!(f, "timeout"),
            TransferError::Nak => write!(f, "NAK"),
            TransferError::Malformed(e) => write!(f, "malformed reply: {}", e),
            TransferError::UnexpectedPid(pid) => write!(f, "unexpected {:?}", pid),
        }
    }
}

impl std::error::Error for TransferError {}

/// What the host learned while enumerating a device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Enumeration {
    pub address: u8,
    pub device: Vec<u8>,
    pub configuration: Vec<u8>,
    pub languages: Vec<u8>,
    pub report_descriptor: Vec<u8>,
}

pub fn get_descriptor(kind: u8, index: u8, length: u16) -> SetupPacket {
    SetupPacket {
        request_type: 0x80,
        request: Request::GET_DESCRIPTOR,
        value: (kind as u16) << 8 | index as u16,
        index: if kind == descriptor_type::STRING && index != 0 { 0x0409 } else { 0 },
        length,
    }
}

pub fn standard_write(request: u8, value: u16) -> SetupPacket {
    SetupPacket { request_type: 0x00, request, value, index: 0, length: 0 }
}

#[derive(Clone)]
pub struct HostModel {
    speed: Speed,
    ref_clock_hz: u64,
    bit_rate: u64,
    /// bit cells laid out so far, for placing cell boundaries on the tick grid
    bit_clock: u64,
    device_drive: Option<LineState>,
    collisions: u32,
    frame: u16,
}

impl HostModel {
    pub fn new(speed: Speed, ref_clock_hz: u32) -> Self {
        HostModel {
            speed,
            ref_clock_hz: ref_clock_hz as u64,
            bit_rate: speed.bit_rate() as u64,
            bit_clock: 0,
            device_drive: None,
            collisions: 0,
            frame: 0,
        }
    }

    pub fn for_device(config: &DeviceConfig) -> Self { Self::new(config.speed, config.ref_clock_hz) }

    /// Runs the host's bit clock `ppm` parts per million fast (positive) or slow (negative).
    pub fn with_skew_ppm(mut self, ppm: i32) -> Result<Self, SoftUsbError> {
        if !(-MAX_SKEW_PPM..=MAX_SKEW_PPM).contains(&ppm) {
            return Err(SoftUsbError::InvalidConfig("host clock skew beyond 100000 ppm"));
        }
        let scaled = self.speed.bit_rate() as u64 * (1_000_000 + ppm as i64) as u64;
        self.bit_rate = scaled / 1_000_000;
        Ok(self)
    }

    /// Ticks on which host and device drove the bus at the same time.
    pub fn collisions(&self) -> u32 { self.collisions }

    fn next_bit_ticks(&mut self) -> u64 {
        let start = self.bit_clock * self.ref_clock_hz / self.bit_rate;
        self.bit_clock += 1;
        self.bit_clock * self.ref_clock_hz / self.bit_rate - start
    }

    /// One reference tick. An undriven bus reads as J.
    fn tick(&mut self, device: &mut Device, host: Option<LineState>) -> LineState {
        let bus = match (host, self.device_drive) {
            (Some(level), Some(_)) => {
                self.collisions += 1;
                level
            }
            (Some(level), None) | (None, Some(level)) => level,
            (None, None) => LineState::J,
        };
        self.device_drive = device.tick_line(bus);
        bus
    }

    fn hold(&mut self, device: &mut Device, level: LineState) {
        for _ in 0..self.next_bit_ticks() {
            self.tick(device, Some(level));
        }
    }

    /// Leave the bus alone for `bits` bit-times.
    pub fn idle(&mut self, device: &mut Device, bits: u32) {
        for _ in 0..bits {
            for _ in 0..self.next_bit_ticks() {
                self.tick(device, None);
            }
        }
    }

    /// Drives SE0 well past the detection threshold, then lets the bus settle.
    pub fn bus_reset(&mut self, device: &mut Device) {
        for _ in 0..self.speed.reset_bits() * 4 {
            self.hold(device, LineState::Se0);
        }
        self.idle(device, 8);
    }

    pub fn send(&mut self, device: &mut Device, packet: &Packet) {
        log::trace!("host -> {:?}", packet);
        self.send_bits(device, &packet.to_bits());
    }

    /// Stuffs, NRZI-encodes and sends a raw bit stream starting with SYNC, then an EOP.
    pub fn send_bits(&mut self, device: &mut Device, bits: &[bool]) {
        for level in nrzi_encode(&bit_stuff(bits), LineState::J) {
            self.hold(device, level);
        }
        self.hold(device, LineState::Se0);
        self.hold(device, LineState::Se0);
        self.hold(device, LineState::J);
    }

    /// Waits for the device to answer and decodes what it sent.
    pub fn receive(&mut self, device: &mut Device) -> Result<Packet, TransferError> {
        let mut codec = LineCodec::new(self.bit_rate as u32, self.ref_clock_hz as u32);
        let bit_ticks = self.ref_clock_hz / self.bit_rate;
        let timeout = RESPONSE_TIMEOUT_BITS as u64 * bit_ticks;
        let mut waited = 0;
        loop {
            let bus = self.tick(device, None);
            if bus == LineState::K {
                codec.clock(bus);
                codec.start_packet();
                break;
            }
            waited += 1;
            if waited > timeout {
                return Err(TransferError::Timeout);
            }
        }

        let mut bits = Vec::new();
        loop {
            let bus = self.tick(device, None);
            if codec.clock(bus) != ClockEdge::Sample {
                continue;
            }
            if bus == LineState::Se0 {
                break;
            }
            let bit = codec.sample_bit(bus);
            if !bit.stuff {
                bits.push(bit.value);
            }
            if bits.len() > MAX_REPLY_BITS {
                return Err(TransferError::Malformed(PacketError::BadLength));
            }
        }
        // rest of the EOP and the idle bit
        for _ in 0..4 * bit_ticks {
            if self.device_drive.is_none() {
                break;
            }
            self.tick(device, None);
        }
        // the tick grid moved on without laying out bit cells
        self.bit_clock = 0;
        let packet = Packet::from_bits(&bits).map_err(TransferError::Malformed)?;
        log::trace!("host <- {:?}", packet);
        Ok(packet)
    }

    fn handshake(&mut self, device: &mut Device) -> Result<(), TransferError> {
        let reply = self.receive(device);
        self.idle(device, INTER_PACKET_BITS);
        match reply? {
            Packet::Handshake(Handshake::Ack) => Ok(()),
            Packet::Handshake(Handshake::Nak) => Err(TransferError::Nak),
            Packet::Handshake(Handshake::Stall) => Err(TransferError::Stall),
            other => Err(TransferError::UnexpectedPid(other.pid())),
        }
    }

    pub fn token(&mut self, device: &mut Device, kind: TokenKind, address: u8, endpoint: u8) {
        self.send(device, &Packet::Token { kind, address, endpoint });
    }

    pub fn start_of_frame(&mut self, device: &mut Device) {
        let frame = self.frame;
        self.frame = (self.frame + 1) & 0x7FF;
        self.send(device, &Packet::Sof { frame });
        self.idle(device, INTER_PACKET_BITS);
    }

    pub fn setup(
        &mut self,
        device: &mut Device,
        address: u8,
        setup: &SetupPacket,
    ) -> Result<(), TransferError> {
        self.token(device, TokenKind::Setup, address, CONTROL_ENDPOINT);
        self.send(device, &Packet::Data { toggle: DataToggle::Data0, payload: setup.to_bytes().to_vec() });
        self.handshake(device)
    }

    /// IN transaction. Data is acknowledged only when `acknowledge` is set.
    pub fn in_transaction(
        &mut self,
        device: &mut Device,
        address: u8,
        endpoint: u8,
        acknowledge: bool,
    ) -> Result<(DataToggle, Vec<u8>), TransferError> {
        self.token(device, TokenKind::In, address, endpoint);
        let reply = self.receive(device);
        self.idle(device, INTER_PACKET_BITS);
        match reply? {
            Packet::Data { toggle, payload } => {
                if acknowledge {
                    self.send(device, &Packet::Handshake(Handshake::Ack));
                    self.idle(device, INTER_PACKET_BITS);
                }
                Ok((toggle, payload))
            }
            Packet::Handshake(Handshake::Nak) => Err(TransferError::Nak),
            Packet::Handshake(Handshake::Stall) => Err(TransferError::Stall),
            other => Err(TransferError::UnexpectedPid(other.pid())),
        }
    }

    pub fn read_packet(
        &mut self,
        device: &mut Device,
        address: u8,
        endpoint: u8,
    ) -> Result<Vec<u8>, TransferError> {
        self.in_transaction(device, address, endpoint, true).map(|(_, data)| data)
    }

    pub fn write_packet(
        &mut self,
        device: &mut Device,
        address: u8,
        endpoint: u8,
        toggle: DataToggle,
        data: &[u8],
    ) -> Result<(), TransferError> {
        self.token(device, TokenKind::Out, address, endpoint);
        self.send(device, &Packet::Data { toggle, payload: data.to_vec() });
        self.handshake(device)
    }

    /// SETUP, IN data stage until a short packet or `length` bytes, OUT status stage.
    pub fn control_read(
        &mut self,
        device: &mut Device,
        address: u8,
        setup: &SetupPacket,
    ) -> Result<Vec<u8>, TransferError> {
        self.setup(device, address, setup)?;
        let mut data = Vec::new();
        loop {
            let chunk = self.read_packet(device, address, CONTROL_ENDPOINT)?;
            let short = chunk.len() < MAX_PACKET;
            data.extend_from_slice(&chunk);
            if short || data.len() >= setup.length as usize {
                break;
            }
        }
        self.write_packet(device, address, CONTROL_ENDPOINT, DataToggle::Data1, &[])?;
        Ok(data)
    }

    /// SETUP, OUT data stage, IN status stage.
    pub fn control_write(
        &mut self,
        device: &mut Device,
        address: u8,
        setup: &SetupPacket,
        data: &[u8],
    ) -> Result<(), TransferError> {
        self.setup(device, address, setup)?;
        let mut toggle = DataToggle::Data1;
        for chunk in data.chunks(MAX_PACKET) {
            self.write_packet(device, address, CONTROL_ENDPOINT, toggle, chunk)?;
            toggle = toggle.toggled();
        }
        let status = self.read_packet(device, address, CONTROL_ENDPOINT)?;
        if !status.is_empty() {
            return Err(TransferError::Malformed(PacketError::BadLength));
        }
        Ok(())
    }

    pub fn poll_interrupt(&mut self, device: &mut Device, address: u8) -> Result<Vec<u8>, TransferError> {
        self.read_packet(device, address, INTERRUPT_ENDPOINT)
    }

    /// Reset, address and configure the device the way a desktop host does.
    pub fn enumerate(&mut self, device: &mut Device, address: u8) -> Result<Enumeration, TransferError> {
        self.bus_reset(device);
        // first read at the default address only cares about bMaxPacketSize0
        self.control_read(device, 0, &get_descriptor(descriptor_type::DEVICE, 0, 64))?;
        self.control_write(device, 0, &standard_write(Request::SET_ADDRESS, address as u16), &[])?;
        self.idle(device, 16);

        let mut found = Enumeration { address, ..Default::default() };
        found.device = self.control_read(device, address, &get_descriptor(descriptor_type::DEVICE, 0, 18))?;
        let head = self.control_read(device, address, &get_descriptor(descriptor_type::CONFIGURATION, 0, 9))?;
        if head.len() < 9 {
            return Err(TransferError::Malformed(PacketError::TooShort));
        }
        let total = u16::from_le_bytes([head[2], head[3]]);
        found.configuration =
            self.control_read(device, address, &get_descriptor(descriptor_type::CONFIGURATION, 0, total))?;
        let get_languages = get_descriptor(descriptor_type::STRING, 0, 255);
        found.languages = self.control_read(device, address, &get_languages)?;

        let value = head[5] as u16;
        self.control_write(device, address, &standard_write(Request::SET_CONFIGURATION, value), &[])?;
        // SET_IDLE(0) to interface 0
        let set_idle = SetupPacket { request_type: 0x21, request: 0x0A, value: 0, index: 0, length: 0 };
        self.control_write(device, address, &set_idle, &[])?;
        let get_report_descriptor = SetupPacket {
            request_type: 0x81,
            request: Request::GET_DESCRIPTOR,
            value: (HID_REPORT_DESCRIPTOR as u16) << 8,
            index: 0,
            length: 255,
        };
        found.report_descriptor = self.control_read(device, address, &get_report_descriptor)?;
        log::info!("enumerated at address {}", address);
        Ok(found)
    }
}
