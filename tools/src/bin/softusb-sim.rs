#[macro_use]
extern crate clap;

use std::path::Path;
use std::process;

use clap::{App, Arg};
use softusb::{DescriptorTable, InjectionPolicy, Speed};
use softusb_tools::sim::{self, PollOutcome, Scenario, SimReport};
use softusb_tools::{parse_report, parse_skew, parse_u32, table_file, SimError};

fn address_arg(value: Option<&str>, name: &str) -> Result<Option<u8>, SimError> {
    match value {
        None => Ok(None),
        Some(text) => {
            let address = parse_u32(text)?;
            if address > 127 {
                return Err(SimError::BadArgument(format!("{} must be 0..=127, not {}", name, address)));
            }
            Ok(Some(address as u8))
        }
    }
}

fn print_polls(label: &str, polls: &[PollOutcome]) {
    for (frame, poll) in polls.iter().enumerate() {
        match poll {
            PollOutcome::Data { bytes } => {
                let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                println!("  {} frame {}: DATA {}", label, frame, hex.join(" "));
            }
            PollOutcome::Nak => println!("  {} frame {}: NAK", label, frame),
            PollOutcome::Stall => println!("  {} frame {}: STALL", label, frame),
            PollOutcome::Timeout => println!("  {} frame {}: no answer", label, frame),
            PollOutcome::Malformed { reason } => println!("  {} frame {}: {}", label, frame, reason),
        }
    }
}

fn print_text(report: &SimReport) {
    println!(
        "{:?} speed device {:04x}:{:04x} at address {}, inject {} deny-of-service {}",
        report.speed,
        report.vendor_id,
        report.product_id,
        report.address,
        report.policy.inject,
        report.policy.deny_of_service
    );
    println!("report descriptor: {} bytes", report.report_descriptor_len);
    print_polls("own", &report.own_polls);
    print_polls("victim", &report.victim_polls);
    for event in report.events.iter() {
        println!("  event: {:?}", event);
    }
    if report.dropped_events != 0 {
        println!("  {} events dropped", report.dropped_events);
    }
    if report.collisions != 0 {
        println!("  {} bit-times where host and device drove the bus together", report.collisions);
    }
    println!("{:#?}", report.stats);
}

fn configure(matches: &clap::ArgMatches, scenario: &mut Scenario) -> Result<DescriptorTable, SimError> {
    if let Some(speed) = matches.value_of("speed") {
        scenario.config.speed = if speed == "full" { Speed::Full } else { Speed::Low };
    }
    scenario.config.ref_clock_hz = parse_u32(matches.value_of("clock").unwrap_or("48000000"))?;
    scenario.config.policy = InjectionPolicy::new(matches.is_present("inject"), matches.is_present("dos"));
    scenario.address = address_arg(matches.value_of("address"), "address")?.unwrap_or(5);
    scenario.victim = address_arg(matches.value_of("victim"), "victim")?;
    scenario.polls = parse_u32(matches.value_of("polls").unwrap_or("4"))?;
    scenario.report = parse_report(matches.value_of("report").unwrap_or("0000040000000000"))?;
    if let Some(skew) = matches.value_of("skew") {
        scenario.skew_ppm = parse_skew(skew)?;
    }
    match matches.value_of("descriptors") {
        Some(path) => table_file::load(Path::new(path)),
        None => Ok(DescriptorTable::boot_keyboard()),
    }
}

fn main() {
    env_logger::init();
    let matches = App::new("softusb simulator")
        .version(crate_version!())
        .author("bunnie <bunnie@kosagi.com>")
        .about("Enumerate a softusb HID device on a simulated bus and poll its interrupt endpoint")
        .arg(
            Arg::with_name("speed")
                .short("s")
                .long("speed")
                .takes_value(true)
                .value_name("SPEED")
                .possible_values(&["low", "full"])
                .help("Bus speed; defaults to the build's configured speed"),
        )
        .arg(
            Arg::with_name("clock")
                .long("clock")
                .takes_value(true)
                .value_name("HZ")
                .default_value("48000000")
                .help("Reference clock the line is sampled at"),
        )
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .takes_value(true)
                .value_name("ADDRESS")
                .default_value("5")
                .help("Address the host assigns during enumeration"),
        )
        .arg(
            Arg::with_name("victim")
                .short("v")
                .long("victim")
                .takes_value(true)
                .value_name("ADDRESS")
                .help("Also poll the interrupt endpoint of this address"),
        )
        .arg(
            Arg::with_name("polls")
                .short("n")
                .long("polls")
                .takes_value(true)
                .value_name("COUNT")
                .default_value("4")
                .help("Number of frames to poll for"),
        )
        .arg(
            Arg::with_name("report")
                .short("r")
                .long("report")
                .takes_value(true)
                .value_name("HEX")
                .default_value("0000040000000000")
                .help("Eight byte input report offered on the interrupt endpoint"),
        )
        .arg(
            Arg::with_name("inject")
                .long("inject")
                .help("Permit transmitting data on behalf of other addresses"),
        )
        .arg(
            Arg::with_name("dos")
                .long("dos")
                .help("Offer data to polls of other addresses instead of a NAK"),
        )
        .arg(
            Arg::with_name("skew")
                .long("skew")
                .takes_value(true)
                .value_name("PPM")
                .allow_hyphen_values(true)
                .help("Host bit clock error in parts per million, at most 100000 either way"),
        )
        .arg(
            Arg::with_name("descriptors")
                .short("d")
                .long("descriptors")
                .takes_value(true)
                .value_name("TABLE_JSON")
                .help("Descriptor table to serve instead of the built-in boot keyboard"),
        )
        .arg(Arg::with_name("json").long("json").help("Print the run as JSON"))
        .get_matches();

    let mut scenario = Scenario::default();
    let parsed = configure(&matches, &mut scenario);
    let table = match parsed {
        Ok(table) => table,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };

    let report = match sim::run(&scenario, table) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    if matches.is_present("json") {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: couldn't serialize run: {}", e);
                process::exit(1);
            }
        }
    } else {
        print_text(&report);
    }
}
