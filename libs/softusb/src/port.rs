//! Local data interface between the device and the application that feeds it.
//!
//! The application supplies the 8-byte input report served on the interrupt endpoint and to
//! GET_REPORT. Everything flowing the other way is queued as a [`PortEvent`].

use std::collections::VecDeque;

pub const REPORT_LEN: usize = crate::MAX_PACKET;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PortEvent {
    /// an OUT data stage (output report, e.g. keyboard LEDs) arrived
    OutputReport([u8; REPORT_LEN]),
    /// the input report was consumed by a poll or GET_REPORT
    ReadRequested,
    /// a feature report latched a new mode byte
    ModeChanged(u8),
    Configured(bool),
}

/// HidPort buffers outgoing events in a queue until the application asks for them. When the queue
/// is full the oldest event is dropped to make room for the new one.
pub struct HidPort {
    input_report: [u8; REPORT_LEN],
    max_events: usize,
    events: VecDeque<PortEvent>,
    dropped: u32,
}

impl HidPort {
    pub fn new(max_events: usize) -> Self {
        HidPort { input_report: [0; REPORT_LEN], max_events, events: VecDeque::new(), dropped: 0 }
    }

    pub fn set_input_report(&mut self, report: [u8; REPORT_LEN]) { self.input_report = report; }

    pub fn input_report(&self) -> [u8; REPORT_LEN] { self.input_report }

    /// Returns the oldest pending event.
    pub fn poll_event(&mut self) -> Option<PortEvent> { self.events.pop_front() }

    pub fn dropped_events(&self) -> u32 { self.dropped }

    /// Hands the current input report to a GET_REPORT and pulses "read requested". Interrupt
    /// polls pulse it from the device once the report is actually on the bus.
    pub(crate) fn consume_input(&mut self) -> [u8; REPORT_LEN] {
        self.push(PortEvent::ReadRequested);
        self.input_report
    }

    pub(crate) fn push(&mut self, event: PortEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            if let Some(old) = self.events.pop_front() {
                self.dropped += 1;
                log::warn!("event queue full, dropping {:?}", old);
            }
        }
        self.events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_dropped() {
        let mut port = HidPort::new(2);
        port.set_input_report([0, 0, 4, 0, 0, 0, 0, 0]);
        assert_eq!(port.consume_input(), [0, 0, 4, 0, 0, 0, 0, 0]);
        port.push(PortEvent::ModeChanged(0x20));
        port.push(PortEvent::Configured(true));
        assert_eq!(port.dropped_events(), 1);
        assert_eq!(port.poll_event(), Some(PortEvent::ModeChanged(0x20)));
        assert_eq!(port.poll_event(), Some(PortEvent::Configured(true)));
        assert_eq!(port.poll_event(), None);
    }
}
