//! The device as seen from the wires.
//!
//! [`Device::tick`] is called once per reference clock period with the sampled pair. The line
//! codec turns ticks into sample and drive edges; the receive engine steps on sample edges while
//! the line is an input, the transmit engine on drive edges once it holds the line. Only one of
//! them owns the line at a time: the transmitter takes it after the receiver has seen enough idle
//! bit-times, and hands it back when the EOP is out.

use crate::control::{ControlState, ControlTransferEngine, DeviceIdentity};
use crate::descriptors::DescriptorTable;
use crate::line::{ClockEdge, DiffPair, Direction, LineCodec, LineState, Speed};
use crate::policy::InjectionPolicy;
use crate::port::{HidPort, PortEvent, REPORT_LEN};
use crate::rx::{BusView, ReceiveEngine, RxEvent, RxState};
use crate::tx::{SendRequest, TransmitEngine, TxOutcome, TxState};
use crate::{EngineStats, SoftUsbError, INTERRUPT_ENDPOINT};

/// Idle bit samples after an EOP before the device may start driving.
pub const TURNAROUND_IDLE_BITS: u32 = 5;
/// A host ACK has to start within this many idle bit-times of our EOP to be credited to us.
pub const ACK_WINDOW_BITS: u32 = 16;
/// Minimum reference ticks per bit for clock recovery to hold lock.
pub const MIN_OVERSAMPLING: u32 = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceConfig {
    pub speed: Speed,
    pub ref_clock_hz: u32,
    pub policy: InjectionPolicy,
    /// application events held before the oldest is dropped
    pub event_queue_depth: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            speed: Speed::default(),
            ref_clock_hz: 48_000_000,
            policy: InjectionPolicy::default(),
            event_queue_depth: 16,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), SoftUsbError> {
        if self.ref_clock_hz / self.speed.bit_rate() < MIN_OVERSAMPLING {
            return Err(SoftUsbError::InvalidConfig("reference clock must be at least 4x the bit rate"));
        }
        if self.event_queue_depth == 0 {
            return Err(SoftUsbError::InvalidConfig("event queue needs room for at least one event"));
        }
        Ok(())
    }
}

pub struct Device {
    speed: Speed,
    codec: LineCodec,
    rx: ReceiveEngine,
    tx: TransmitEngine,
    control: ControlTransferEngine,
    port: HidPort,
    policy: InjectionPolicy,
    stats: EngineStats,
    /// endpoint of the data packet we last put on the wire, until the host's ACK or timeout
    awaiting_ack: Option<u8>,
}

impl Device {
    pub fn new(config: DeviceConfig, table: DescriptorTable) -> Result<Self, SoftUsbError> {
        config.validate()?;
        log::info!(
            "{:?}-speed device, {} ticks per bit, policy {:?}",
            config.speed,
            config.ref_clock_hz / config.speed.bit_rate(),
            config.policy
        );
        Ok(Device {
            speed: config.speed,
            codec: LineCodec::new(config.speed.bit_rate(), config.ref_clock_hz),
            rx: ReceiveEngine::new(config.speed.reset_bits()),
            tx: TransmitEngine::new(),
            control: ControlTransferEngine::new(table),
            port: HidPort::new(config.event_queue_depth),
            policy: config.policy,
            stats: EngineStats::default(),
            awaiting_ack: None,
        })
    }

    /// Advance one reference tick. Returns the levels the device drives, or None while its
    /// drivers are tri-stated.
    pub fn tick(&mut self, pair: DiffPair) -> Option<DiffPair> {
        let level = self.speed.decode(pair);
        self.tick_line(level).map(|driven| self.speed.encode(driven))
    }

    /// [`Device::tick`] on already decoded line states.
    pub fn tick_line(&mut self, level: LineState) -> Option<LineState> {
        match self.codec.clock(level) {
            ClockEdge::Sample if self.codec.direction() == Direction::Input => self.sample(level),
            ClockEdge::Drive => self.drive(),
            _ => {}
        }
        match self.codec.direction() {
            Direction::Output => Some(self.codec.tx_level()),
            Direction::Input => None,
        }
    }

    fn sample(&mut self, level: LineState) {
        let identity = *self.control.identity();
        let view = BusView {
            address: identity.address,
            stalled: self.control.stalled(),
            nak_interrupt_polling: identity.nak_interrupt_polling(),
        };
        let dispatch = self.rx.step(&mut self.codec, level, &view, &self.policy, &mut self.stats);
        if self.awaiting_ack.is_some() && self.rx.idle_bits() > ACK_WINDOW_BITS {
            log::trace!("no ACK for endpoint {:?}", self.awaiting_ack);
            self.awaiting_ack = None;
        }
        if let Some(event) = dispatch.event {
            self.handle(event);
        }
        if let Some(handshake) = dispatch.handshake {
            let address = self.control.identity().address;
            self.tx.request(SendRequest::handshake(handshake, address, crate::CONTROL_ENDPOINT));
        }
    }

    fn handle(&mut self, event: RxEvent) {
        if event != RxEvent::Ack {
            self.awaiting_ack = None;
        }
        match event {
            RxEvent::BusReset => {
                log::info!("bus reset");
                self.tx.abort(&mut self.codec);
                self.codec.reset();
                self.control.bus_reset(&mut self.port);
            }
            RxEvent::SetupToken => {
                self.tx.cancel();
                self.control.setup_token();
            }
            RxEvent::SetupReady(bytes) => self.control.setup_ready(&bytes, &mut self.port, &mut self.stats),
            RxEvent::OutReady { data, len } => self.control.out_data(&data, len, &mut self.port),
            RxEvent::StatusOut => self.control.status_out(),
            RxEvent::ControlIn { address } => {
                let reply = self.control.control_in(address, &mut self.stats);
                self.tx.request(reply);
            }
            RxEvent::InterruptIn { address } => {
                let reply = self.control.interrupt_in(address, &mut self.port);
                self.tx.request(reply);
            }
            RxEvent::Ack => match self.awaiting_ack.take() {
                Some(endpoint) => self.control.ack(endpoint),
                None => log::trace!("ACK for someone else's data"),
            },
        }
    }

    fn drive(&mut self) {
        if !self.tx.active() && (!self.tx.pending() || self.rx.idle_bits() < TURNAROUND_IDLE_BITS) {
            return;
        }
        let own = self.control.identity().address;
        match self.tx.step(&mut self.codec, own, &self.policy, &mut self.stats) {
            TxOutcome::Busy => {}
            TxOutcome::Withdrawn(_) => self.control.send_complete(),
            TxOutcome::Complete(sent) => {
                self.rx.line_returned();
                if sent.pid.is_data() {
                    if sent.endpoint == INTERRUPT_ENDPOINT {
                        self.port.push(PortEvent::ReadRequested);
                    }
                    self.awaiting_ack = Some(sent.endpoint);
                }
                self.control.send_complete();
            }
        }
    }

    pub fn speed(&self) -> Speed { self.speed }

    pub fn policy(&self) -> InjectionPolicy { self.policy }

    /// The switches may change at any time; they are consulted at the next decision point.
    pub fn set_policy(&mut self, policy: InjectionPolicy) {
        if policy != self.policy {
            log::info!("policy {:?}", policy);
        }
        self.policy = policy;
    }

    pub fn set_input_report(&mut self, report: [u8; REPORT_LEN]) { self.port.set_input_report(report); }

    pub fn poll_event(&mut self) -> Option<PortEvent> { self.port.poll_event() }

    pub fn dropped_events(&self) -> u32 { self.port.dropped_events() }

    pub fn identity(&self) -> &DeviceIdentity { self.control.identity() }

    pub fn address(&self) -> u8 { self.control.identity().address }

    pub fn configured(&self) -> bool { self.control.identity().configured() }

    pub fn mode(&self) -> u8 { self.control.identity().mode }

    pub fn stats(&self) -> EngineStats { self.stats }

    pub fn rx_state(&self) -> RxState { self.rx.state() }

    pub fn tx_state(&self) -> TxState { self.tx.state() }

    pub fn control_state(&self) -> ControlState { self.control.state() }

    pub fn driving(&self) -> bool { self.codec.direction() == Direction::Output }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(DeviceConfig::default().validate().is_ok());
        let slow = DeviceConfig { speed: Speed::Full, ref_clock_hz: 24_000_000, ..Default::default() };
        assert!(matches!(slow.validate(), Err(SoftUsbError::InvalidConfig(_))));
        let no_queue = DeviceConfig { event_queue_depth: 0, ..Default::default() };
        assert!(Device::new(no_queue, DescriptorTable::boot_keyboard()).is_err());
    }

    #[test]
    fn test_idle_bus_is_quiet() {
        let mut device = Device::new(DeviceConfig::default(), DescriptorTable::boot_keyboard()).unwrap();
        let idle = device.speed().encode(LineState::J);
        for _ in 0..10_000 {
            assert_eq!(device.tick(idle), None);
        }
        assert_eq!(device.rx_state(), RxState::Idle);
        assert_eq!(device.stats(), EngineStats::default());
    }
}
