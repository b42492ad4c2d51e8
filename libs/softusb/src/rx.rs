//! Receive engine: rebuilds packets from sampled bit cells, gates tokens by address and PID
//! check, and dispatches transactions on end-of-packet.
//!
//! One call to [`ReceiveEngine::step`] consumes exactly one recovered bit cell.

use crate::crc16::Crc16;
use crate::line::{LineCodec, LineState};
use crate::packet::{Handshake, Pid, TokenFields, SYNC_BYTE};
use crate::policy::{InjectionPolicy, InterruptOffer};
use crate::{EngineStats, CONTROL_ENDPOINT, INTERRUPT_ENDPOINT};

/// Data payload plus CRC16, in bits.
const DATA_TAIL_BITS: usize = (crate::MAX_PACKET + 2) * 8;
/// Anything shorter than this after a DATA PID is a zero-length status packet.
const STATUS_PACKET_BITS: usize = 18;

/// The slice of device state the receiver needs for its decisions.
#[derive(Copy, Clone, Debug, Default)]
pub struct BusView {
    pub address: u8,
    pub stalled: bool,
    pub nak_interrupt_polling: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RxEvent {
    BusReset,
    /// a SETUP token was accepted; the control context starts over
    SetupToken,
    SetupReady([u8; 8]),
    OutReady { data: [u8; 8], len: usize },
    /// zero-length data packet closing a control transfer
    StatusOut,
    ControlIn { address: u8 },
    InterruptIn { address: u8 },
    Ack,
}

/// Result of one step: an event for the control engine and/or a handshake for the transmitter.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub event: Option<RxEvent>,
    pub handshake: Option<Handshake>,
}

impl Dispatch {
    fn event(event: RxEvent) -> Self { Dispatch { event: Some(event), handshake: None } }

    fn reply(event: RxEvent, handshake: Handshake) -> Self {
        Dispatch { event: Some(event), handshake: Some(handshake) }
    }

    fn handshake(handshake: Handshake) -> Self { Dispatch { event: None, handshake: Some(handshake) } }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RxState {
    Idle,
    BusResetCheck { se0_bits: u32, reported: bool },
    SyncAndPid,
    TokenTail,
    DataTail,
    HandshakeTail,
    /// malformed start; wait for end-of-packet
    Discard,
}

pub struct ReceiveEngine {
    state: RxState,
    reset_threshold: u32,
    shift: u32,
    bits: usize,
    pid: Pid,
    buf: [u8; crate::MAX_PACKET + 2],
    overflow: bool,
    crc: Crc16,
    setup_pending: bool,
    out_pending: bool,
    idle_bits: u32,
}

impl ReceiveEngine {
    pub fn new(reset_threshold: u32) -> Self {
        ReceiveEngine {
            state: RxState::Idle,
            reset_threshold,
            shift: 0,
            bits: 0,
            pid: Pid::Sof,
            buf: [0; crate::MAX_PACKET + 2],
            overflow: false,
            crc: Crc16::new(),
            setup_pending: false,
            out_pending: false,
            idle_bits: 0,
        }
    }

    pub fn state(&self) -> RxState { self.state }

    /// Idle bit cells seen since the last end-of-packet; zero while a packet is in flight.
    pub fn idle_bits(&self) -> u32 { if self.state == RxState::Idle { self.idle_bits } else { 0 } }

    /// The transmitter just gave the line back.
    pub fn line_returned(&mut self) {
        self.state = RxState::Idle;
        self.idle_bits = 0;
    }

    pub fn reset(&mut self) {
        self.setup_pending = false;
        self.out_pending = false;
        self.idle_bits = 0;
    }

    pub fn step(
        &mut self,
        codec: &mut LineCodec,
        level: LineState,
        view: &BusView,
        policy: &InjectionPolicy,
        stats: &mut EngineStats,
    ) -> Dispatch {
        if level == LineState::Se0 {
            return self.single_ended_zero(view, policy, stats);
        }
        match self.state {
            RxState::BusResetCheck { .. } | RxState::Idle => {
                if let RxState::BusResetCheck { .. } = self.state {
                    self.state = RxState::Idle;
                    self.idle_bits = 0;
                }
                match level {
                    LineState::J => self.idle_bits = self.idle_bits.saturating_add(1),
                    LineState::K => {
                        codec.start_packet();
                        self.shift = 0;
                        self.bits = 0;
                        self.idle_bits = 0;
                        self.state = RxState::SyncAndPid;
                        self.accumulate(codec.sample_bit(level).value);
                    }
                    _ => self.idle_bits = 0,
                }
            }
            RxState::Discard => {}
            _ => {
                let bit = codec.sample_bit(level);
                if !bit.stuff {
                    self.accumulate(bit.value);
                }
            }
        }
        Dispatch::default()
    }

    fn accumulate(&mut self, bit: bool) {
        match self.state {
            RxState::SyncAndPid => {
                self.shift |= (bit as u32) << self.bits;
                self.bits += 1;
                if self.bits == 16 {
                    self.header_complete();
                }
            }
            RxState::TokenTail => {
                if self.bits < 16 {
                    self.shift |= (bit as u32) << self.bits;
                }
                self.bits += 1;
            }
            RxState::DataTail => {
                if self.bits < DATA_TAIL_BITS {
                    self.crc.update_bit(bit);
                    self.buf[self.bits / 8] |= (bit as u8) << (self.bits % 8);
                } else {
                    self.overflow = true;
                }
                self.bits += 1;
            }
            _ => {}
        }
    }

    fn header_complete(&mut self) {
        if self.shift as u8 != SYNC_BYTE {
            log::trace!("bad sync {:02x}", self.shift as u8);
            self.state = RxState::Discard;
            return;
        }
        let pid = match Pid::from_byte((self.shift >> 8) as u8) {
            Ok(pid) => pid,
            Err(e) => {
                log::trace!("rejecting packet: {}", e);
                // a damaged token ends whatever transaction was open
                self.setup_pending = false;
                self.out_pending = false;
                self.state = RxState::Discard;
                return;
            }
        };
        self.pid = pid;
        self.shift = 0;
        self.bits = 0;
        self.state = if pid.is_token() {
            RxState::TokenTail
        } else if pid.is_data() {
            self.crc.reset();
            self.buf = [0; crate::MAX_PACKET + 2];
            self.overflow = false;
            RxState::DataTail
        } else if pid == Pid::Pre {
            RxState::Discard
        } else {
            RxState::HandshakeTail
        };
    }

    fn single_ended_zero(
        &mut self,
        view: &BusView,
        policy: &InjectionPolicy,
        stats: &mut EngineStats,
    ) -> Dispatch {
        let dispatch = match self.state {
            RxState::BusResetCheck { se0_bits, reported } => {
                let se0_bits = se0_bits.saturating_add(1);
                let fire = !reported && se0_bits >= self.reset_threshold;
                self.state = RxState::BusResetCheck { se0_bits, reported: reported || fire };
                if fire {
                    stats.bus_resets += 1;
                    self.reset();
                    return Dispatch::event(RxEvent::BusReset);
                }
                return Dispatch::default();
            }
            RxState::TokenTail => self.token_dispatch(view, policy, stats),
            RxState::DataTail => self.data_dispatch(view, stats),
            RxState::HandshakeTail => {
                if self.pid == Pid::Ack {
                    Dispatch::event(RxEvent::Ack)
                } else {
                    Dispatch::default()
                }
            }
            RxState::Idle | RxState::SyncAndPid | RxState::Discard => Dispatch::default(),
        };
        self.state = RxState::BusResetCheck { se0_bits: 1, reported: false };
        dispatch
    }

    fn token_dispatch(
        &mut self,
        view: &BusView,
        policy: &InjectionPolicy,
        stats: &mut EngineStats,
    ) -> Dispatch {
        if self.bits < 16 {
            log::trace!("short token ({} bits)", self.bits);
            return Dispatch::default();
        }
        let fields = TokenFields(self.shift as u16);
        let (address, endpoint) = (fields.address(), fields.endpoint());
        if self.pid == Pid::Sof {
            return Dispatch::default();
        }
        if !policy.accepts_token(view.address, address, endpoint) {
            stats.tokens_rejected += 1;
            self.setup_pending = false;
            self.out_pending = false;
            return Dispatch::default();
        }
        stats.tokens_accepted += 1;
        log::trace!("token {:?} {}:{}", self.pid, address, endpoint);
        self.setup_pending = false;
        self.out_pending = false;
        match (self.pid, endpoint) {
            (Pid::Setup, CONTROL_ENDPOINT) => {
                self.setup_pending = true;
                Dispatch::event(RxEvent::SetupToken)
            }
            (Pid::Out, CONTROL_ENDPOINT) => {
                self.out_pending = true;
                Dispatch::default()
            }
            (Pid::In, CONTROL_ENDPOINT) => Dispatch::event(RxEvent::ControlIn { address }),
            (Pid::In, INTERRUPT_ENDPOINT) => {
                match policy.interrupt_offer(view.address, address, view.nak_interrupt_polling) {
                    InterruptOffer::Data => Dispatch::event(RxEvent::InterruptIn { address }),
                    InterruptOffer::Nak => {
                        if address != view.address {
                            log::debug!("NAK on behalf of address {}", address);
                        }
                        stats.naks += 1;
                        Dispatch::handshake(Handshake::Nak)
                    }
                }
            }
            (pid, endpoint) => {
                log::trace!("{:?} to endpoint {} carries no function here", pid, endpoint);
                Dispatch::default()
            }
        }
    }

    fn data_dispatch(&mut self, view: &BusView, stats: &mut EngineStats) -> Dispatch {
        if !self.setup_pending && !self.out_pending {
            return Dispatch::default();
        }
        if self.bits < STATUS_PACKET_BITS {
            self.setup_pending = false;
            self.out_pending = false;
            let handshake = if view.stalled { Handshake::Stall } else { Handshake::Ack };
            return Dispatch::reply(RxEvent::StatusOut, handshake);
        }
        if self.overflow || self.bits % 8 != 0 || !self.crc.is_residual() {
            // no handshake: the host will retry the transaction
            stats.crc_failures += 1;
            log::trace!(
                "dropping {:?} packet: {} bits, crc {:04x}",
                self.pid,
                self.bits,
                self.crc.register()
            );
            return Dispatch::default();
        }
        let len = self.bits / 8 - 2;
        let mut data = [0u8; 8];
        data[..len].copy_from_slice(&self.buf[..len]);
        if self.setup_pending {
            self.setup_pending = false;
            if len != 8 {
                log::debug!("SETUP data stage of {} bytes ignored", len);
                return Dispatch::default();
            }
            Dispatch::reply(RxEvent::SetupReady(data), Handshake::Ack)
        } else {
            self.out_pending = false;
            let handshake = if view.stalled { Handshake::Stall } else { Handshake::Ack };
            Dispatch::reply(RxEvent::OutReady { data, len }, handshake)
        }
    }
}
