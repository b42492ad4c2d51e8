use super::*;
use crate::host::TransferError;
use crate::packet::{DataToggle, Handshake, Packet};
use crate::INTERRUPT_ENDPOINT;

const OWN: u8 = 5;
const VICTIM: u8 = 7;

#[test]
fn test_own_interrupt_polls() {
    let (mut device, mut host) = enumerated(InjectionPolicy::default(), OWN);
    let first = host.in_transaction(&mut device, OWN, INTERRUPT_ENDPOINT, true).unwrap();
    let second = host.in_transaction(&mut device, OWN, INTERRUPT_ENDPOINT, true).unwrap();
    assert_eq!(first, (DataToggle::Data0, KEY_A.to_vec()));
    assert_eq!(second, (DataToggle::Data1, KEY_A.to_vec()));
    assert_eq!(drain(&mut device), vec![PortEvent::ReadRequested, PortEvent::ReadRequested]);

    // a poll the host never acknowledges does not advance the toggle
    host.in_transaction(&mut device, OWN, INTERRUPT_ENDPOINT, false).unwrap();
    host.idle(&mut device, 40);
    let (toggle, _) = host.in_transaction(&mut device, OWN, INTERRUPT_ENDPOINT, true).unwrap();
    assert_eq!(toggle, DataToggle::Data0);
}

#[test]
fn test_polls_nak_until_configured() {
    let (mut device, mut host) = bench(Speed::Low, InjectionPolicy::new(true, true));
    host.bus_reset(&mut device);
    device.set_input_report(KEY_A);
    assert_eq!(host.poll_interrupt(&mut device, 0), Err(TransferError::Nak));
    assert_eq!(host.poll_interrupt(&mut device, VICTIM), Err(TransferError::Nak));
    assert_eq!(device.stats().naks, 2);
    assert_eq!(device.stats().data_sent, 0);
}

#[test]
fn test_foreign_poll_truth_table() {
    let cases = [
        // (inject, deny_of_service, victim poll outcome)
        (false, false, Err(TransferError::Nak)),
        (false, true, Err(TransferError::Timeout)),
        (true, false, Err(TransferError::Nak)),
        (true, true, Ok(KEY_A.to_vec())),
    ];
    for (inject, dos, expected) in cases.iter().cloned() {
        let (mut device, mut host) = enumerated(InjectionPolicy::new(inject, dos), OWN);
        let before = device.stats();
        assert_eq!(host.poll_interrupt(&mut device, VICTIM), expected, "inject {} dos {}", inject, dos);
        let after = device.stats();
        // the token gate let the foreign poll in every time
        assert_eq!(after.tokens_accepted, before.tokens_accepted + 1);
        match (inject, dos) {
            (false, true) => {
                assert_eq!(after.sends_suppressed, before.sends_suppressed + 1);
                assert_eq!(after.data_sent, before.data_sent);
            }
            (true, true) => assert_eq!(after.data_sent, before.data_sent + 1),
            _ => assert_eq!(after.naks, before.naks + 1),
        }
        // the application hears about a read only when its report went out
        let reads = if inject && dos { vec![PortEvent::ReadRequested] } else { vec![] };
        assert_eq!(drain(&mut device), reads, "inject {} dos {}", inject, dos);
        // our own polls are unaffected by the switches
        assert_eq!(host.poll_interrupt(&mut device, OWN).map(|d| d.len()), Ok(8));
        assert_eq!(host.collisions(), 0);
    }
}

#[test]
fn test_policy_changes_at_runtime() {
    let (mut device, mut host) = enumerated(InjectionPolicy::default(), OWN);
    assert_eq!(host.poll_interrupt(&mut device, VICTIM), Err(TransferError::Nak));
    device.set_policy(InjectionPolicy::new(true, true));
    assert_eq!(host.poll_interrupt(&mut device, VICTIM), Ok(KEY_A.to_vec()));
    device.set_policy(InjectionPolicy::new(false, true));
    assert_eq!(host.poll_interrupt(&mut device, VICTIM), Err(TransferError::Timeout));
}

#[test]
fn test_ack_for_suppressed_data_is_not_credited() {
    let (mut device, mut host) = enumerated(InjectionPolicy::new(false, true), OWN);
    // the victim would answer here; the host acknowledges its data
    assert_eq!(host.poll_interrupt(&mut device, VICTIM), Err(TransferError::Timeout));
    host.send(&mut device, &Packet::Handshake(Handshake::Ack));
    host.idle(&mut device, 4);
    let (toggle, _) = host.in_transaction(&mut device, OWN, INTERRUPT_ENDPOINT, true).unwrap();
    assert_eq!(toggle, DataToggle::Data0);
}
