//! Bench runs: a host model enumerates the device, then polls its interrupt endpoint and
//! optionally a second address sharing the bus.

use serde::Serialize;
use softusb::host::{HostModel, TransferError};
use softusb::{DescriptorTable, Device, DeviceConfig, EngineStats, InjectionPolicy, PortEvent, Speed};

use crate::SimError;

#[derive(Clone, Debug)]
pub struct Scenario {
    pub config: DeviceConfig,
    pub address: u8,
    /// another function on the same bus whose interrupt endpoint the host also polls
    pub victim: Option<u8>,
    pub polls: u32,
    pub report: [u8; 8],
    pub skew_ppm: i32,
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario {
            config: DeviceConfig::default(),
            address: 5,
            victim: None,
            polls: 4,
            report: [0, 0, 4, 0, 0, 0, 0, 0],
            skew_ppm: 0,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Data { bytes: Vec<u8> },
    Nak,
    Stall,
    /// nothing answered before the host gave up
    Timeout,
    Malformed { reason: String },
}

impl From<Result<Vec<u8>, TransferError>> for PollOutcome {
    fn from(result: Result<Vec<u8>, TransferError>) -> Self {
        match result {
            Ok(bytes) => PollOutcome::Data { bytes },
            Err(TransferError::Nak) => PollOutcome::Nak,
            Err(TransferError::Stall) => PollOutcome::Stall,
            Err(TransferError::Timeout) => PollOutcome::Timeout,
            Err(e) => PollOutcome::Malformed { reason: e.to_string() },
        }
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct SimReport {
    pub speed: Speed,
    pub address: u8,
    pub policy: InjectionPolicy,
    pub vendor_id: u16,
    pub product_id: u16,
    pub report_descriptor_len: usize,
    pub own_polls: Vec<PollOutcome>,
    pub victim_polls: Vec<PollOutcome>,
    pub events: Vec<PortEvent>,
    pub dropped_events: u32,
    pub collisions: u32,
    /// counters as they stood once enumeration finished
    pub enumeration_stats: EngineStats,
    pub stats: EngineStats,
}

pub fn run(scenario: &Scenario, table: DescriptorTable) -> Result<SimReport, SimError> {
    let mut device = Device::new(scenario.config, table)?;
    let mut host = HostModel::for_device(&scenario.config).with_skew_ppm(scenario.skew_ppm)?;

    let found = host.enumerate(&mut device, scenario.address)?;
    log::debug!(
        "{} byte configuration, {} byte report descriptor",
        found.configuration.len(),
        found.report_descriptor.len()
    );
    let enumeration_stats = device.stats();
    device.set_input_report(scenario.report);

    let mut own_polls = Vec::new();
    let mut victim_polls = Vec::new();
    for frame in 0..scenario.polls {
        host.start_of_frame(&mut device);
        own_polls.push(PollOutcome::from(host.poll_interrupt(&mut device, scenario.address)));
        if let Some(victim) = scenario.victim {
            let outcome = PollOutcome::from(host.poll_interrupt(&mut device, victim));
            log::debug!("frame {}: poll of {} -> {:?}", frame, victim, outcome);
            victim_polls.push(outcome);
        }
    }

    let mut events = Vec::new();
    while let Some(event) = device.poll_event() {
        events.push(event);
    }

    Ok(SimReport {
        speed: device.speed(),
        address: device.address(),
        policy: device.policy(),
        vendor_id: u16::from_le_bytes([found.device[8], found.device[9]]),
        product_id: u16::from_le_bytes([found.device[10], found.device[11]]),
        report_descriptor_len: found.report_descriptor.len(),
        own_polls,
        victim_polls,
        events,
        dropped_events: device.dropped_events(),
        collisions: host.collisions(),
        enumeration_stats,
        stats: device.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(inject: bool, dos: bool) -> Scenario {
        let mut scenario = Scenario { victim: Some(7), polls: 2, ..Default::default() };
        scenario.config.speed = Speed::Low;
        scenario.config.policy = InjectionPolicy::new(inject, dos);
        scenario
    }

    #[test]
    fn test_passive_run() {
        let report = run(&scenario(false, false), DescriptorTable::boot_keyboard()).unwrap();
        assert_eq!((report.vendor_id, report.product_id), (0x1209, 0x0001));
        assert_eq!(report.address, 5);
        let key = PollOutcome::Data { bytes: vec![0, 0, 4, 0, 0, 0, 0, 0] };
        assert_eq!(report.own_polls, vec![key.clone(), key]);
        assert_eq!(report.victim_polls, vec![PollOutcome::Nak, PollOutcome::Nak]);
        assert_eq!(report.collisions, 0);
        assert_eq!(report.stats.data_sent - report.enumeration_stats.data_sent, 2);
    }

    #[test]
    fn test_injecting_run() {
        let report = run(&scenario(true, true), DescriptorTable::boot_keyboard()).unwrap();
        assert!(report.victim_polls.iter().all(|p| matches!(p, PollOutcome::Data { .. })));
        assert_eq!(report.stats.data_sent - report.enumeration_stats.data_sent, 4);

        let silent = run(&scenario(false, true), DescriptorTable::boot_keyboard()).unwrap();
        assert_eq!(silent.victim_polls, vec![PollOutcome::Timeout, PollOutcome::Timeout]);
        assert_eq!(silent.stats.sends_suppressed, 2);
    }

    #[test]
    fn test_out_of_range_skew_is_an_error() {
        let wild = Scenario { skew_ppm: -1_000_000, ..scenario(false, false) };
        assert!(matches!(run(&wild, DescriptorTable::boot_keyboard()), Err(SimError::Device(_))));
    }

    #[test]
    fn test_report_serializes() {
        let report = run(&scenario(false, false), DescriptorTable::boot_keyboard()).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["victim_polls"][0]["outcome"], "nak");
        assert_eq!(json["stats"]["naks"], report.enumeration_stats.naks + 2);
    }
}
