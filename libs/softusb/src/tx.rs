//! Transmit engine: frames a send request onto the line one bit cell per drive edge.
//!
//! Data packets pass a last policy check before the line is claimed, so a transaction can be
//! accepted by the receive side and still never produce bus activity.

use crate::crc16::Crc16;
use crate::line::{LineCodec, LineState};
use crate::packet::{DataToggle, Handshake, Pid, SYNC_BYTE};
use crate::policy::InjectionPolicy;
use crate::EngineStats;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub pid: Pid,
    /// bus address of the token this packet answers
    pub target: u8,
    pub endpoint: u8,
    pub len: usize,
    pub payload: [u8; crate::MAX_PACKET],
}

impl SendRequest {
    pub fn handshake(handshake: Handshake, target: u8, endpoint: u8) -> Self {
        SendRequest { pid: handshake.pid(), target, endpoint, len: 0, payload: [0; crate::MAX_PACKET] }
    }

    /// `data` is truncated to one packet.
    pub fn data(toggle: DataToggle, target: u8, endpoint: u8, data: &[u8]) -> Self {
        let len = data.len().min(crate::MAX_PACKET);
        let mut payload = [0; crate::MAX_PACKET];
        payload[..len].copy_from_slice(&data[..len]);
        SendRequest { pid: toggle.pid(), target, endpoint, len, payload }
    }

    pub fn data_bytes(&self) -> &[u8] { &self.payload[..self.len] }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxState {
    WaitRequest,
    Sync { bit: u8 },
    Pid { bit: u8 },
    Payload { byte: usize, bit: u8 },
    Crc { bit: u8 },
    Eop { step: u8 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxOutcome {
    Busy,
    /// the send-time gate pulled the request back; nothing was driven
    Withdrawn(SendRequest),
    Complete(SendRequest),
}

pub struct TransmitEngine {
    state: TxState,
    request: Option<SendRequest>,
    crc: Crc16,
    crc_out: u16,
}

impl Default for TransmitEngine {
    fn default() -> Self { Self::new() }
}

impl TransmitEngine {
    pub fn new() -> Self {
        TransmitEngine { state: TxState::WaitRequest, request: None, crc: Crc16::new(), crc_out: 0 }
    }

    pub fn state(&self) -> TxState { self.state }

    /// A request is queued and waiting for the line.
    pub fn pending(&self) -> bool { self.state == TxState::WaitRequest && self.request.is_some() }

    /// Currently driving the line.
    pub fn active(&self) -> bool { self.state != TxState::WaitRequest }

    /// Queue a packet. Rejected while another send is in flight; a queued but unstarted request
    /// is replaced.
    pub fn request(&mut self, request: SendRequest) -> bool {
        if self.active() {
            log::warn!("transmitter busy, dropping {:?}", request.pid);
            return false;
        }
        self.request = Some(request);
        true
    }

    pub fn cancel(&mut self) { self.request = None; }

    pub fn abort(&mut self, codec: &mut LineCodec) {
        self.request = None;
        self.state = TxState::WaitRequest;
        codec.release();
    }

    /// One drive edge. Must only be called once the line has been granted to the transmitter.
    pub fn step(
        &mut self,
        codec: &mut LineCodec,
        own_address: u8,
        policy: &InjectionPolicy,
        stats: &mut EngineStats,
    ) -> TxOutcome {
        let request = match self.request {
            Some(r) => r,
            None => return TxOutcome::Busy,
        };
        match self.state {
            TxState::WaitRequest => {
                if request.pid.is_data() && !policy.permits_send(own_address, request.target) {
                    log::debug!("withdrawing {:?} for address {}", request.pid, request.target);
                    stats.sends_suppressed += 1;
                    self.request = None;
                    return TxOutcome::Withdrawn(request);
                }
                codec.start_transmit();
                self.crc.reset();
                self.state = TxState::Sync { bit: 0 };
            }
            TxState::Sync { bit } => {
                codec.emit_bit(SYNC_BYTE & (1 << bit) != 0);
                self.state = if bit == 7 { TxState::Pid { bit: 0 } } else { TxState::Sync { bit: bit + 1 } };
            }
            TxState::Pid { bit } => {
                if codec.emit_bit(request.pid.byte() & (1 << bit) != 0).consumed {
                    self.state = if bit < 7 {
                        TxState::Pid { bit: bit + 1 }
                    } else if !request.pid.is_data() {
                        TxState::Eop { step: 0 }
                    } else if request.len == 0 {
                        self.crc_out = self.crc.finish();
                        TxState::Crc { bit: 0 }
                    } else {
                        TxState::Payload { byte: 0, bit: 0 }
                    };
                }
            }
            TxState::Payload { byte, bit } => {
                let value = request.payload[byte] & (1 << bit) != 0;
                if codec.emit_bit(value).consumed {
                    self.crc.update_bit(value);
                    self.state = if bit < 7 {
                        TxState::Payload { byte, bit: bit + 1 }
                    } else if byte + 1 < request.len {
                        TxState::Payload { byte: byte + 1, bit: 0 }
                    } else {
                        self.crc_out = self.crc.finish();
                        TxState::Crc { bit: 0 }
                    };
                }
            }
            TxState::Crc { bit } => {
                if codec.emit_bit(self.crc_out & (1 << bit) != 0).consumed {
                    self.state =
                        if bit < 15 { TxState::Crc { bit: bit + 1 } } else { TxState::Eop { step: 0 } };
                }
            }
            TxState::Eop { step } => match step {
                0 if codec.stuff_pending() => {
                    codec.emit_bit(false);
                }
                0 | 1 => {
                    codec.drive(LineState::Se0);
                    self.state = TxState::Eop { step: step + 1 };
                }
                2 => {
                    codec.drive(LineState::J);
                    self.state = TxState::Eop { step: 3 };
                }
                _ => {
                    codec.release();
                    self.state = TxState::WaitRequest;
                    self.request = None;
                    if request.pid.is_data() {
                        stats.data_sent += 1;
                    }
                    log::trace!("sent {:?} {:x?} to {}", request.pid, request.data_bytes(), request.target);
                    return TxOutcome::Complete(request);
                }
            },
        }
        TxOutcome::Busy
    }
}
