//! Control transfers on endpoint 0.
//!
//! A SETUP data stage is dispatched once into a [`ResponseSource`] and a byte count. Every IN on
//! endpoint 0 afterwards serves the 8-byte chunk selected by the packet index, and only a host
//! ACK for data this device actually sent moves the index on. Requests that cannot be served
//! put the engine in Stall until the next SETUP token or bus reset.
//!
//! The engine also owns the device identity (address, configuration, mode byte) and the data
//! toggle of the interrupt endpoint.

use usb_device::control::{Recipient, Request, RequestType};
use usb_device::descriptor::descriptor_type;

use crate::descriptors::{DescriptorTable, HID_CLASS_DESCRIPTOR, HID_REPORT_DESCRIPTOR};
use crate::packet::{DataToggle, Handshake, SetupPacket};
use crate::port::{HidPort, PortEvent, REPORT_LEN};
use crate::tx::SendRequest;
use crate::{EngineStats, CONTROL_ENDPOINT, INTERRUPT_ENDPOINT, MAX_PACKET};

/// Mode bit that opens the interrupt endpoint to polling.
pub const MODE_INTERRUPT_ENABLE: u8 = 1 << 5;

// HID class requests
const HID_GET_REPORT: u8 = 0x01;
const HID_GET_IDLE: u8 = 0x02;
const HID_GET_PROTOCOL: u8 = 0x03;
const HID_SET_REPORT: u8 = 0x09;
const HID_SET_IDLE: u8 = 0x0A;
const HID_SET_PROTOCOL: u8 = 0x0B;
const HID_REPORT_TYPE_FEATURE: u8 = 3;
const HID_PROTOCOL_REPORT: u8 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// 0 until a SET_ADDRESS status stage has been acknowledged
    pub address: u8,
    pub configuration: u8,
    pub mode: u8,
    pub remote_wakeup: bool,
    pub protocol: u8,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        DeviceIdentity {
            address: 0,
            configuration: 0,
            mode: 0,
            remote_wakeup: false,
            protocol: HID_PROTOCOL_REPORT,
        }
    }
}

impl DeviceIdentity {
    pub fn configured(&self) -> bool { self.configuration != 0 }

    pub fn nak_interrupt_polling(&self) -> bool { self.mode & MODE_INTERRUPT_ENABLE == 0 }
}

/// Where the bytes of the current control read come from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseSource {
    /// zero-length status or write acknowledgement
    Empty,
    Device,
    Configuration,
    String(u8),
    HidReport,
    HidClass,
    /// input report snapshot taken when GET_REPORT was dispatched
    InputReport([u8; REPORT_LEN]),
    Status([u8; 2]),
    /// configuration value, alternate setting, idle rate or protocol
    Byte(u8),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlTransferContext {
    pub source: ResponseSource,
    pub total: usize,
    /// 1-based index of the next packet to serve
    pub packet_index: u32,
    pub stall: bool,
    pub toggle: DataToggle,
    /// the next OUT payload is a feature report carrying the mode byte
    pub feature_report: bool,
    /// SET_ADDRESS value waiting for its status stage to be acknowledged
    pub pending_address: Option<u8>,
}

impl Default for ControlTransferContext {
    fn default() -> Self {
        ControlTransferContext {
            source: ResponseSource::Empty,
            total: 0,
            packet_index: 1,
            stall: false,
            toggle: DataToggle::Data1,
            feature_report: false,
            pending_address: None,
        }
    }
}

impl ControlTransferContext {
    /// Bytes still owed to the host; negative once the host reads past the end.
    pub fn remaining(&self) -> i64 {
        self.total as i64 - (self.packet_index as i64 - 1) * MAX_PACKET as i64
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlState {
    WaitEvent,
    /// a reply is queued or on the wire
    WaitClear,
    Stall,
}

/// Why a request was refused with STALL.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StallReason {
    /// no handler for this request and recipient
    Unsupported { request_type: u8, request: u8 },
    /// descriptor type not served by this device
    UnknownDescriptor(u8),
    /// string index past the end of the string list
    StringIndex(u8),
    /// interface or alternate setting other than 0
    NonDefaultSetting { value: u16, index: u16 },
    /// endpoint feature selector other than ENDPOINT_HALT
    EndpointFeature(u16),
    Vendor(u8),
    /// IN token after the whole response was acknowledged
    Overrun,
}

pub struct ControlTransferEngine {
    table: DescriptorTable,
    identity: DeviceIdentity,
    ctx: ControlTransferContext,
    state: ControlState,
    interrupt_toggle: DataToggle,
}

impl ControlTransferEngine {
    pub fn new(table: DescriptorTable) -> Self {
        ControlTransferEngine {
            table,
            identity: DeviceIdentity::default(),
            ctx: ControlTransferContext::default(),
            state: ControlState::WaitEvent,
            interrupt_toggle: DataToggle::Data0,
        }
    }

    pub fn table(&self) -> &DescriptorTable { &self.table }

    pub fn identity(&self) -> &DeviceIdentity { &self.identity }

    pub fn context(&self) -> &ControlTransferContext { &self.ctx }

    pub fn state(&self) -> ControlState { self.state }

    pub fn stalled(&self) -> bool { self.ctx.stall }

    pub fn interrupt_toggle(&self) -> DataToggle { self.interrupt_toggle }

    pub fn bus_reset(&mut self, port: &mut HidPort) {
        let old = self.identity;
        self.identity = DeviceIdentity::default();
        self.ctx = ControlTransferContext::default();
        self.state = ControlState::WaitEvent;
        self.interrupt_toggle = DataToggle::Data0;
        if old.configured() {
            port.push(PortEvent::Configured(false));
        }
        if old.mode != 0 {
            port.push(PortEvent::ModeChanged(0));
        }
    }

    /// A SETUP token starts a new transfer and clears any stall.
    pub fn setup_token(&mut self) {
        if self.ctx.stall {
            log::debug!("stall cleared by SETUP");
        }
        self.ctx = ControlTransferContext::default();
        self.state = ControlState::WaitEvent;
    }

    pub fn setup_ready(&mut self, bytes: &[u8; 8], port: &mut HidPort, stats: &mut EngineStats) {
        let setup = SetupPacket::from_bytes(bytes);
        log::debug!(
            "setup {:?} type {:02x} request {:02x} value {:04x} index {:04x} length {}",
            setup.direction(),
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );
        match self.dispatch(&setup, port) {
            Ok(source) => {
                self.ctx.total = self.source_len(&source).min(setup.length as usize);
                self.ctx.source = source;
                self.state = ControlState::WaitClear;
            }
            Err(reason) => self.stall(reason, stats),
        }
    }

    /// Builds the reply to an IN token on endpoint 0. Until ACKed, the same chunk is served again.
    pub fn control_in(&mut self, address: u8, stats: &mut EngineStats) -> SendRequest {
        if !self.ctx.stall && self.ctx.remaining() < 0 {
            self.stall(StallReason::Overrun, stats);
        }
        if self.ctx.stall {
            return SendRequest::handshake(Handshake::Stall, address, CONTROL_ENDPOINT);
        }
        let len = (self.ctx.remaining() as usize).min(MAX_PACKET);
        let offset = (self.ctx.packet_index as usize - 1) * MAX_PACKET;
        let chunk = self.load_chunk(offset, len);
        self.state = ControlState::WaitClear;
        SendRequest::data(self.ctx.toggle, address, CONTROL_ENDPOINT, &chunk[..len])
    }

    /// The host acknowledged data this device sent on `endpoint`.
    pub fn ack(&mut self, endpoint: u8) {
        match endpoint {
            CONTROL_ENDPOINT => {
                self.ctx.packet_index += 1;
                self.ctx.toggle = self.ctx.toggle.toggled();
                if let Some(address) = self.ctx.pending_address.take() {
                    log::info!("address {} latched", address);
                    self.identity.address = address;
                }
            }
            INTERRUPT_ENDPOINT => self.interrupt_toggle = self.interrupt_toggle.toggled(),
            _ => {}
        }
    }

    pub fn out_data(&mut self, data: &[u8; 8], len: usize, port: &mut HidPort) {
        if self.ctx.stall {
            return;
        }
        if self.ctx.feature_report {
            self.ctx.feature_report = false;
            if len > 0 {
                self.set_mode(data[0], port);
            }
        } else {
            port.push(PortEvent::OutputReport(*data));
        }
        self.state = ControlState::WaitClear;
    }

    /// Zero-length OUT: the host closed a control read.
    pub fn status_out(&mut self) {
        self.ctx.feature_report = false;
        if !self.ctx.stall {
            self.state = ControlState::WaitClear;
        }
    }

    /// Arms the input report for an interrupt poll.
    pub fn interrupt_in(&mut self, address: u8, port: &HidPort) -> SendRequest {
        let report = port.input_report();
        SendRequest::data(self.interrupt_toggle, address, INTERRUPT_ENDPOINT, &report)
    }

    /// The transmitter finished with, or withdrew, the last reply.
    pub fn send_complete(&mut self) {
        if self.state == ControlState::WaitClear {
            self.state = ControlState::WaitEvent;
        }
    }

    fn stall(&mut self, reason: StallReason, stats: &mut EngineStats) {
        log::debug!("stall: {:?}", reason);
        stats.stalls += 1;
        self.ctx.stall = true;
        self.state = ControlState::Stall;
    }

    fn set_mode(&mut self, mode: u8, port: &mut HidPort) {
        if mode != self.identity.mode {
            log::info!("mode {:02x}", mode);
            self.identity.mode = mode;
            port.push(PortEvent::ModeChanged(mode));
        }
    }

    fn set_configuration(&mut self, value: u8, port: &mut HidPort) {
        let was = self.identity.configured();
        self.identity.configuration = value;
        self.interrupt_toggle = DataToggle::Data0;
        let mode = if value != 0 {
            self.identity.mode | MODE_INTERRUPT_ENABLE
        } else {
            self.identity.mode & !MODE_INTERRUPT_ENABLE
        };
        self.set_mode(mode, port);
        if was != self.identity.configured() {
            log::info!("configuration {}", value);
            port.push(PortEvent::Configured(value != 0));
        }
    }

    fn dispatch(&mut self, setup: &SetupPacket, port: &mut HidPort) -> Result<ResponseSource, StallReason> {
        let unsupported =
            StallReason::Unsupported { request_type: setup.request_type, request: setup.request };
        match (setup.kind(), setup.recipient()) {
            (RequestType::Standard, Recipient::Device) => match setup.request {
                Request::GET_DESCRIPTOR => match setup.value_high() {
                    descriptor_type::DEVICE => Ok(ResponseSource::Device),
                    descriptor_type::CONFIGURATION => Ok(ResponseSource::Configuration),
                    descriptor_type::STRING => {
                        let index = setup.value_low();
                        match self.table.string(index) {
                            Some(_) => Ok(ResponseSource::String(index)),
                            None => Err(StallReason::StringIndex(index)),
                        }
                    }
                    other => Err(StallReason::UnknownDescriptor(other)),
                },
                Request::SET_ADDRESS => {
                    self.ctx.pending_address = Some(setup.value_low() & 0x7F);
                    Ok(ResponseSource::Empty)
                }
                Request::GET_STATUS => {
                    let status = self.table.self_powered() as u8 | (self.identity.remote_wakeup as u8) << 1;
                    Ok(ResponseSource::Status([status, 0]))
                }
                Request::SET_CONFIGURATION => {
                    self.set_configuration(setup.value_low(), port);
                    Ok(ResponseSource::Empty)
                }
                Request::GET_CONFIGURATION => Ok(ResponseSource::Byte(self.identity.configuration)),
                Request::SET_FEATURE | Request::CLEAR_FEATURE
                    if setup.value == Request::FEATURE_DEVICE_REMOTE_WAKEUP =>
                {
                    self.identity.remote_wakeup = setup.request == Request::SET_FEATURE;
                    Ok(ResponseSource::Empty)
                }
                _ => Err(unsupported),
            },
            (RequestType::Standard, Recipient::Interface) => match setup.request {
                Request::GET_DESCRIPTOR => match setup.value_high() {
                    HID_REPORT_DESCRIPTOR => Ok(ResponseSource::HidReport),
                    HID_CLASS_DESCRIPTOR if self.table.hid_class().is_some() => Ok(ResponseSource::HidClass),
                    other => Err(StallReason::UnknownDescriptor(other)),
                },
                Request::GET_STATUS => Ok(ResponseSource::Status([0, 0])),
                Request::SET_INTERFACE if setup.value == 0 && setup.index == 0 => Ok(ResponseSource::Empty),
                Request::GET_INTERFACE if setup.index == 0 => Ok(ResponseSource::Byte(0)),
                Request::SET_INTERFACE | Request::GET_INTERFACE => {
                    Err(StallReason::NonDefaultSetting { value: setup.value, index: setup.index })
                }
                _ => Err(unsupported),
            },
            (RequestType::Standard, Recipient::Endpoint) => match setup.request {
                Request::GET_STATUS => Ok(ResponseSource::Status([0, 0])),
                Request::SET_FEATURE | Request::CLEAR_FEATURE => {
                    if setup.value != Request::FEATURE_ENDPOINT_HALT {
                        return Err(StallReason::EndpointFeature(setup.value));
                    }
                    let endpoint = setup.index as u8 & 0x7F;
                    if setup.request == Request::CLEAR_FEATURE && endpoint == INTERRUPT_ENDPOINT {
                        self.interrupt_toggle = DataToggle::Data0;
                    }
                    Ok(ResponseSource::Empty)
                }
                _ => Err(unsupported),
            },
            (RequestType::Class, Recipient::Interface) => match setup.request {
                HID_GET_REPORT => Ok(ResponseSource::InputReport(port.consume_input())),
                HID_SET_REPORT => {
                    self.ctx.feature_report = setup.value_high() == HID_REPORT_TYPE_FEATURE;
                    Ok(ResponseSource::Empty)
                }
                // idle rate stays at zero: reports only go out when polled
                HID_SET_IDLE => Ok(ResponseSource::Empty),
                HID_GET_IDLE => Ok(ResponseSource::Byte(0)),
                HID_GET_PROTOCOL => Ok(ResponseSource::Byte(self.identity.protocol)),
                HID_SET_PROTOCOL => {
                    self.identity.protocol = setup.value_low();
                    Ok(ResponseSource::Empty)
                }
                _ => Err(unsupported),
            },
            (RequestType::Vendor, _) => Err(StallReason::Vendor(setup.request)),
            _ => Err(unsupported),
        }
    }

    fn source_len(&self, source: &ResponseSource) -> usize {
        match source {
            ResponseSource::Empty => 0,
            ResponseSource::Device => self.table.device().len(),
            ResponseSource::Configuration => self.table.configuration().len(),
            ResponseSource::String(index) => self.table.string(*index).map_or(0, |s| s.len()),
            ResponseSource::HidReport => self.table.hid_report().len(),
            ResponseSource::HidClass => self.table.hid_class().map_or(0, |d| d.len()),
            ResponseSource::InputReport(_) => REPORT_LEN,
            ResponseSource::Status(_) => 2,
            ResponseSource::Byte(_) => 1,
        }
    }

    fn load_chunk(&self, offset: usize, len: usize) -> [u8; MAX_PACKET] {
        let bytes: &[u8] = match &self.ctx.source {
            ResponseSource::Empty => &[],
            ResponseSource::Device => self.table.device(),
            ResponseSource::Configuration => self.table.configuration(),
            ResponseSource::String(index) => self.table.string(*index).unwrap_or(&[]),
            ResponseSource::HidReport => self.table.hid_report(),
            ResponseSource::HidClass => self.table.hid_class().unwrap_or(&[]),
            ResponseSource::InputReport(report) => &report[..],
            ResponseSource::Status(status) => &status[..],
            ResponseSource::Byte(b) => std::slice::from_ref(b),
        };
        let mut chunk = [0u8; MAX_PACKET];
        let end = (offset + len).min(bytes.len());
        if offset < end {
            chunk[..end - offset].copy_from_slice(&bytes[offset..end]);
        }
        chunk
    }
}
