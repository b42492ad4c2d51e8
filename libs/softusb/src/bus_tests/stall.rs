use usb_device::control::Request;
use usb_device::descriptor::descriptor_type;

use super::*;
use crate::host::{get_descriptor, standard_write, TransferError};
use crate::packet::{DataToggle, SetupPacket, TokenKind};
use crate::{CONTROL_ENDPOINT, INTERRUPT_ENDPOINT};

const ADDRESS: u8 = 4;

fn set_report(report_type: u8) -> SetupPacket {
    SetupPacket { request_type: 0x21, request: 0x09, value: (report_type as u16) << 8, index: 0, length: 8 }
}

#[test]
fn test_stall_recovers_on_next_setup() {
    let (mut device, mut host) = enumerated(InjectionPolicy::default(), ADDRESS);
    let vendor = SetupPacket { request_type: 0xC0, request: 0x42, value: 0, index: 0, length: 4 };
    assert_eq!(host.control_read(&mut device, ADDRESS, &vendor), Err(TransferError::Stall));
    // every later data or status request is refused too
    assert_eq!(host.read_packet(&mut device, ADDRESS, CONTROL_ENDPOINT), Err(TransferError::Stall));
    assert_eq!(
        host.write_packet(&mut device, ADDRESS, CONTROL_ENDPOINT, DataToggle::Data1, &[]),
        Err(TransferError::Stall)
    );

    let setup = get_descriptor(descriptor_type::DEVICE, 0, 18);
    assert_eq!(host.control_read(&mut device, ADDRESS, &setup).unwrap().len(), 18);

    let alternate =
        SetupPacket { request_type: 0x01, request: Request::SET_INTERFACE, value: 1, index: 0, length: 0 };
    assert_eq!(host.control_write(&mut device, ADDRESS, &alternate, &[]), Err(TransferError::Stall));
    let default = SetupPacket { value: 0, ..alternate };
    assert_eq!(host.control_write(&mut device, ADDRESS, &default, &[]), Ok(()));
    assert_eq!(device.stats().stalls, 2);
}

#[test]
fn test_read_past_end_stalls() {
    let (mut device, mut host) = enumerated(InjectionPolicy::default(), ADDRESS);
    host.setup(&mut device, ADDRESS, &get_descriptor(descriptor_type::DEVICE, 0, 18)).unwrap();
    let mut sizes = Vec::new();
    for _ in 0..3 {
        sizes.push(host.read_packet(&mut device, ADDRESS, CONTROL_ENDPOINT).unwrap().len());
    }
    assert_eq!(sizes, vec![8, 8, 2]);
    assert_eq!(host.read_packet(&mut device, ADDRESS, CONTROL_ENDPOINT), Err(TransferError::Stall));
    assert_eq!(device.stats().stalls, 1);
}

#[test]
fn test_unacknowledged_in_is_repeated() {
    let (mut device, mut host) = enumerated(InjectionPolicy::default(), ADDRESS);
    let table = DescriptorTable::boot_keyboard();
    host.setup(&mut device, ADDRESS, &get_descriptor(descriptor_type::CONFIGURATION, 0, 34)).unwrap();
    let first = host.in_transaction(&mut device, ADDRESS, CONTROL_ENDPOINT, false).unwrap();
    host.idle(&mut device, 40);
    let again = host.in_transaction(&mut device, ADDRESS, CONTROL_ENDPOINT, true).unwrap();
    assert_eq!(first, again);
    assert_eq!(first, (DataToggle::Data1, table.configuration()[..8].to_vec()));
    let next = host.in_transaction(&mut device, ADDRESS, CONTROL_ENDPOINT, true).unwrap();
    assert_eq!(next, (DataToggle::Data0, table.configuration()[8..16].to_vec()));
}

#[test]
fn test_corrupted_setup_gets_no_handshake() {
    let (mut device, mut host) = enumerated(InjectionPolicy::default(), ADDRESS);
    let setup = get_descriptor(descriptor_type::DEVICE, 0, 18);
    host.token(&mut device, TokenKind::Setup, ADDRESS, CONTROL_ENDPOINT);
    let payload = setup.to_bytes().to_vec();
    let mut bits = crate::packet::Packet::Data { toggle: DataToggle::Data0, payload }.to_bits();
    bits[40] = !bits[40];
    host.send_bits(&mut device, &bits);
    assert_eq!(host.receive(&mut device), Err(TransferError::Timeout));
    assert_eq!(device.stats().crc_failures, 1);
    // the host's retry goes through
    host.idle(&mut device, 4);
    assert_eq!(host.control_read(&mut device, ADDRESS, &setup).unwrap().len(), 18);
}

#[test]
fn test_reports() {
    let (mut device, mut host) = enumerated(InjectionPolicy::default(), ADDRESS);
    let get_report = SetupPacket { request_type: 0xA1, request: 0x01, value: 0x0100, index: 0, length: 8 };
    assert_eq!(host.control_read(&mut device, ADDRESS, &get_report), Ok(KEY_A.to_vec()));
    assert_eq!(drain(&mut device), vec![PortEvent::ReadRequested]);

    // output report: keyboard LEDs
    host.control_write(&mut device, ADDRESS, &set_report(2), &[0x02]).unwrap();
    assert_eq!(drain(&mut device), vec![PortEvent::OutputReport([0x02, 0, 0, 0, 0, 0, 0, 0])]);
    assert_eq!(device.mode(), 0x20);

    // feature report: the first byte becomes the mode, and clearing bit 5 closes the endpoint
    host.control_write(&mut device, ADDRESS, &set_report(3), &[0x01]).unwrap();
    assert_eq!(device.mode(), 0x01);
    assert_eq!(drain(&mut device), vec![PortEvent::ModeChanged(0x01)]);
    assert_eq!(host.poll_interrupt(&mut device, ADDRESS), Err(TransferError::Nak));

    host.control_write(&mut device, ADDRESS, &set_report(3), &[0x21]).unwrap();
    assert_eq!(host.poll_interrupt(&mut device, ADDRESS), Ok(KEY_A.to_vec()));
}

#[test]
fn test_deconfigure_and_halt_clear() {
    let (mut device, mut host) = enumerated(InjectionPolicy::default(), ADDRESS);
    assert!(host.poll_interrupt(&mut device, ADDRESS).is_ok());
    let clear_halt =
        SetupPacket { request_type: 0x02, request: Request::CLEAR_FEATURE, value: 0, index: 0x81, length: 0 };
    host.control_write(&mut device, ADDRESS, &clear_halt, &[]).unwrap();
    let (toggle, _) = host.in_transaction(&mut device, ADDRESS, INTERRUPT_ENDPOINT, true).unwrap();
    assert_eq!(toggle, DataToggle::Data0);

    host.control_write(&mut device, ADDRESS, &standard_write(Request::SET_CONFIGURATION, 0), &[]).unwrap();
    assert!(!device.configured());
    assert_eq!(host.poll_interrupt(&mut device, ADDRESS), Err(TransferError::Nak));
    let get_configuration = SetupPacket {
        request_type: 0x80,
        request: Request::GET_CONFIGURATION,
        value: 0,
        index: 0,
        length: 1,
    };
    assert_eq!(host.control_read(&mut device, ADDRESS, &get_configuration), Ok(vec![0]));
}
