//! Connection pipeline, teardown and request gating against a scripted
//! transport.

mod common;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use common::{alpha, beta, config, drain, states, wait_for, Call, MockTransport, Op, Script};
use eeg_link::driver::Driver;
use eeg_link::error::{DriverError, TransportError};
use eeg_link::mailbox::{opcode, MailboxCommand, MailboxResponse};
use eeg_link::orchestrator::Orchestrator;
use eeg_link::transport::{NotificationChannel, ScanFilter};
use eeg_link::types::{ConnectionState, DeviceInfo, DeviceInfoKind, DriverEvent, PendingRequest};

use ConnectionState::*;

fn connected_driver(script: Script) -> (MockTransport, Driver, mpsc::Receiver<DriverEvent>) {
    let mock = MockTransport::new(script);
    let (driver, events) = Driver::new(mock.clone(), config());
    (mock, driver, events)
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fresh_connect_visits_every_state_in_order() {
    let (mock, driver, mut events) = connected_driver(Script::default());

    driver.connect().await.unwrap();

    let seen = drain(&mut events);
    assert_eq!(
        states(&seen),
        vec![
            ReadyForOperation,
            Scanning,
            DeviceFound,
            Connecting,
            Connected,
            DiscoveringCapabilities,
            ReadingInfo(DeviceInfoKind::FirmwareVersion),
            ReadingInfo(DeviceInfoKind::HardwareVersion),
            ReadingInfo(DeviceInfoKind::SerialNumber),
            ReadingInfo(DeviceInfoKind::ModelNumber),
            Bonding,
            NegotiatingTransportParams,
            Ready,
        ]
    );
    assert_eq!(driver.state(), Ready);

    let info: Vec<DeviceInfo> = seen
        .iter()
        .filter_map(|e| match e {
            DriverEvent::DeviceInfo(i) => Some(i.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        info,
        vec![
            DeviceInfo::FirmwareVersion("1.7.4".into()),
            DeviceInfo::HardwareVersion("rev C".into()),
            DeviceInfo::SerialNumber("1010100123".into()),
            DeviceInfo::ModelNumber("alpha-2ch".into()),
        ]
    );
    assert!(seen
        .iter()
        .any(|e| matches!(e, DriverEvent::DeviceSelected(d) if d.address == alpha().address)));

    let calls = mock.calls();
    assert!(calls.contains(&Call::RequestPairing));
    assert!(calls.contains(&Call::Negotiate(47)));
    assert!(calls.contains(&Call::Subscribe(NotificationChannel::Mailbox)));
    assert_eq!(mock.written_opcodes(), vec![opcode::AUDIO_CONNECT, opcode::TRANSMIT_MTU]);
}

#[tokio::test(start_paused = true)]
async fn advance_in_ready_does_nothing() {
    let mock = MockTransport::new(Script::default());
    let (events, _events_rx) = mpsc::channel(256);
    let (state, _) = watch::channel(Idle);
    let mut orchestrator = Orchestrator::new(Arc::new(mock.clone()), config(), events, state);
    let cancel = CancellationToken::new();

    orchestrator.connect(&cancel).await.unwrap();
    assert_eq!(orchestrator.state(), Ready);
    assert_eq!(orchestrator.session().samples_per_frame, Some(1));
    assert_eq!(orchestrator.session().mtu, 47);

    let before = mock.call_count();
    orchestrator.advance(&cancel).await.unwrap();
    orchestrator.connect(&cancel).await.unwrap();
    assert_eq!(orchestrator.state(), Ready);
    assert_eq!(mock.call_count(), before);
}

#[tokio::test(start_paused = true)]
async fn step_only_runs_from_its_pre_state() {
    let mock = MockTransport::new(Script::default());
    let (events, _events_rx) = mpsc::channel(256);
    let (state, _) = watch::channel(Idle);
    let mut orchestrator = Orchestrator::new(Arc::new(mock.clone()), config(), events, state);
    let cancel = CancellationToken::new();

    assert!(!orchestrator.step(Scanning, &cancel).await.unwrap());
    assert_eq!(orchestrator.state(), Idle);
    assert_eq!(mock.call_count(), 0);

    assert!(orchestrator.step(Idle, &cancel).await.unwrap());
    assert_eq!(orchestrator.state(), ReadyForOperation);
}

#[tokio::test(start_paused = true)]
async fn already_linked_headset_skips_the_handshake() {
    let script = Script {
        already_connected: Some(alpha()),
        ..Script::default()
    };
    let (mock, driver, mut events) = connected_driver(script);

    driver.connect().await.unwrap();

    assert_eq!(states(&drain(&mut events)), vec![ReadyForOperation, Ready]);
    let calls = mock.calls();
    assert!(!calls.contains(&Call::Scan));
    assert!(calls.contains(&Call::Subscribe(NotificationChannel::Mailbox)));

    driver.read_info(DeviceInfoKind::BatteryLevel).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn foreign_linked_headset_is_reported() {
    let script = Script {
        already_connected: Some(beta()),
        ..Script::default()
    };
    let mock = MockTransport::new(script);
    let config = eeg_link::config::DriverConfig {
        scan_filter: ScanFilter {
            name_prefix: Some("alpha_".into()),
            ..ScanFilter::default()
        },
        ..config()
    };
    let (driver, _events) = Driver::new(mock.clone(), config);

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(err, DriverError::AnotherDeviceConnected(ref name) if name == "beta_0042"));
    assert_eq!(driver.state(), AnotherDeviceConnected);
    assert!(!mock.calls().contains(&Call::Scan));
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scan_without_a_match_times_out() {
    let script = Script {
        advertisements: vec![],
        ..Script::default()
    };
    let (mock, driver, _events) = connected_driver(script);

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(err, DriverError::StepTimeout { step: Scanning, .. }));
    assert_eq!(driver.state(), ScanFailed);
    assert_eq!(mock.calls(), vec![Call::ConnectedDevice, Call::Scan, Call::StopScan]);
}

#[tokio::test(start_paused = true)]
async fn rejected_connection_lands_in_connect_failed() {
    let script = Script {
        connect_error: true,
        ..Script::default()
    };
    let (mock, driver, _events) = connected_driver(script);

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(err, DriverError::Transport(TransportError::Rejected(_))));
    assert_eq!(driver.state(), ConnectFailed);
    assert!(!mock.calls().contains(&Call::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn stalled_discovery_times_out_and_releases_the_link() {
    let mut script = Script::default();
    script.stall.insert(Op::Discover);
    let (mock, driver, _events) = connected_driver(script);

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::StepTimeout {
            step: DiscoveringCapabilities,
            ..
        }
    ));
    assert_eq!(driver.state(), DiscoveryFailed);
    assert_eq!(mock.calls().last(), Some(&Call::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn failed_state_allows_a_fresh_attempt() {
    let script = Script {
        connect_error: true,
        ..Script::default()
    };
    let (mock, driver, _events) = connected_driver(script);

    assert!(driver.connect().await.is_err());
    mock.script().connect_error = false;

    driver.connect().await.unwrap();
    assert_eq!(driver.state(), Ready);
}

#[tokio::test(start_paused = true)]
async fn stalled_connect_times_out() {
    let mut script = Script::default();
    script.stall.insert(Op::Connect);
    let (mock, driver, _events) = connected_driver(script);

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(err, DriverError::StepTimeout { step: Connecting, .. }));
    assert_eq!(driver.state(), ConnectFailed);
    assert!(!mock.calls().contains(&Call::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn missing_info_attribute_lands_in_read_failed() {
    let mut script = Script::default();
    script.info.remove(&DeviceInfoKind::SerialNumber);
    let (mock, driver, _events) = connected_driver(script);

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Transport(TransportError::MissingAttribute(_))
    ));
    assert_eq!(driver.state(), ReadFailed);
    let calls = mock.calls();
    assert!(!calls.contains(&Call::ReadInfo(DeviceInfoKind::ModelNumber)));
    assert_eq!(calls.last(), Some(&Call::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn stalled_info_read_times_out() {
    let mut script = Script::default();
    script.stall.insert(Op::ReadInfo);
    let (mock, driver, _events) = connected_driver(script);

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::StepTimeout {
            step: ReadingInfo(DeviceInfoKind::FirmwareVersion),
            ..
        }
    ));
    assert_eq!(driver.state(), ReadFailed);
    assert_eq!(mock.calls().last(), Some(&Call::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn unanswered_transmit_mtu_lands_in_negotiation_failed() {
    let mut script = Script::default();
    script.silent.insert(opcode::TRANSMIT_MTU);
    let (mock, driver, _events) = connected_driver(script);

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::StepTimeout {
            step: NegotiatingTransportParams,
            ..
        }
    ));
    assert_eq!(driver.state(), NegotiationFailed);
    assert_eq!(mock.written_opcodes().last(), Some(&opcode::TRANSMIT_MTU));
    assert_eq!(mock.calls().last(), Some(&Call::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn stalled_mtu_request_lands_in_negotiation_failed() {
    let mut script = Script::default();
    script.stall.insert(Op::Negotiate);
    let (mock, driver, _events) = connected_driver(script);

    assert!(driver.connect().await.is_err());
    assert_eq!(driver.state(), NegotiationFailed);
    assert!(!mock.written_opcodes().contains(&opcode::TRANSMIT_MTU));
    assert_eq!(mock.calls().last(), Some(&Call::Disconnect));
}

// ── Bonding ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn silent_audio_attempt_is_retried() {
    let script = Script {
        audio_attempts: VecDeque::from([vec![], vec![0x00]]),
        ..Script::default()
    };
    let (mock, driver, _events) = connected_driver(script);

    driver.connect().await.unwrap();
    assert_eq!(driver.state(), Ready);
    let audio_writes = mock
        .written_opcodes()
        .into_iter()
        .filter(|&op| op == opcode::AUDIO_CONNECT)
        .count();
    assert_eq!(audio_writes, 2);
}

#[tokio::test(start_paused = true)]
async fn silent_audio_link_fails_after_every_attempt() {
    let mut script = Script::default();
    script.silent.insert(opcode::AUDIO_CONNECT);
    let (mock, driver, _events) = connected_driver(script);

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(err, DriverError::UnexpectedResponse(_)));
    assert_eq!(driver.state(), BondFailed);
    assert_eq!(mock.written_opcodes(), vec![opcode::AUDIO_CONNECT; 3]);
}

#[tokio::test(start_paused = true)]
async fn audio_link_is_retried_until_it_comes_up() {
    let script = Script {
        audio_attempts: VecDeque::from([vec![0x02], vec![0x02], vec![0x01, 0x00]]),
        ..Script::default()
    };
    let (mock, driver, _events) = connected_driver(script);

    driver.connect().await.unwrap();
    let audio_writes = mock
        .written_opcodes()
        .into_iter()
        .filter(|&op| op == opcode::AUDIO_CONNECT)
        .count();
    assert_eq!(audio_writes, 3);
}

#[tokio::test(start_paused = true)]
async fn audio_link_gives_up_after_the_retry_budget() {
    let script = Script {
        audio_attempts: VecDeque::from([vec![0x02], vec![0x02], vec![0x02], vec![0x00]]),
        ..Script::default()
    };
    let (mock, driver, _events) = connected_driver(script);

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(err, DriverError::UnexpectedResponse(_)));
    assert_eq!(driver.state(), BondFailed);
    assert_eq!(mock.written_opcodes(), vec![opcode::AUDIO_CONNECT; 3]);
}

#[tokio::test(start_paused = true)]
async fn jack_connected_is_not_retried() {
    let script = Script {
        audio_attempts: VecDeque::from([vec![0x03]]),
        ..Script::default()
    };
    let (mock, driver, _events) = connected_driver(script);

    assert!(driver.connect().await.is_err());
    assert_eq!(driver.state(), BondFailed);
    assert_eq!(mock.written_opcodes(), vec![opcode::AUDIO_CONNECT]);
}

#[tokio::test(start_paused = true)]
async fn bonded_link_skips_pairing() {
    let script = Script {
        bonded: true,
        ..Script::default()
    };
    let (mock, driver, _events) = connected_driver(script);

    driver.connect().await.unwrap();
    let calls = mock.calls();
    assert!(calls.contains(&Call::IsBonded));
    assert!(!calls.contains(&Call::RequestPairing));
}

#[tokio::test(start_paused = true)]
async fn missing_optional_capabilities_skip_their_steps() {
    let mut script = Script::default();
    script.capabilities.pairing = false;
    script.capabilities.mtu_negotiation = false;
    let (mock, driver, _events) = connected_driver(script);

    driver.connect().await.unwrap();
    let calls = mock.calls();
    assert!(!calls.contains(&Call::IsBonded));
    assert!(!calls.iter().any(|c| matches!(c, Call::Negotiate(_))));
    assert_eq!(mock.written_opcodes(), vec![opcode::AUDIO_CONNECT]);
}

// ── Interrupt and teardown ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn interrupt_cancels_a_stalled_step() {
    let mut script = Script::default();
    script.stall.insert(Op::Pairing);
    let (mock, driver, _events) = connected_driver(script);

    let connecting = driver.clone();
    let pending = tokio::spawn(async move { connecting.connect().await });
    driver
        .watch_state()
        .wait_for(|s| *s == Bonding)
        .await
        .unwrap();

    driver.interrupt().await.unwrap();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, DriverError::Interrupted));
    assert_eq!(driver.state(), Interrupted);
    assert_eq!(mock.calls().last(), Some(&Call::Disconnect));

    mock.script().stall.clear();
    driver.connect().await.unwrap();
    assert_eq!(driver.state(), Ready);
}

#[tokio::test(start_paused = true)]
async fn interrupt_while_idle_is_a_no_op() {
    let (mock, driver, _events) = connected_driver(Script::default());

    driver.interrupt().await.unwrap();
    assert_eq!(driver.state(), Idle);
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_walks_back_to_idle() {
    let (mock, driver, mut events) = connected_driver(Script::default());
    driver.connect().await.unwrap();
    drain(&mut events);

    driver.disconnect().await.unwrap();

    assert_eq!(states(&drain(&mut events)), vec![Disconnecting, Disconnected, Idle]);
    assert_eq!(mock.calls().last(), Some(&Call::Disconnect));
    assert!(matches!(
        driver.read_info(DeviceInfoKind::FirmwareVersion).await,
        Err(DriverError::NotConnected(Idle))
    ));
}

#[tokio::test(start_paused = true)]
async fn lost_link_tears_the_session_down() {
    let (mock, driver, mut events) = connected_driver(Script::default());
    driver.connect().await.unwrap();
    drain(&mut events);

    mock.drop_link();
    driver
        .watch_state()
        .wait_for(|s| *s == Idle)
        .await
        .unwrap();

    let seen = states(&drain(&mut events));
    assert_eq!(seen, vec![Disconnecting, Disconnected, Idle]);
}

// ── Requests ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn link_requests_fail_fast_before_ready() {
    let (mock, driver, _events) = connected_driver(Script::default());

    for request in [
        PendingRequest::ReadInfo(DeviceInfoKind::SerialNumber),
        PendingRequest::SendCommand(MailboxCommand::GetBattery),
    ] {
        assert!(matches!(
            driver.submit(request),
            Err(DriverError::NotConnected(Idle))
        ));
    }
    assert_eq!(mock.call_count(), 0);
    assert!(!driver.is_busy());
}

#[tokio::test(start_paused = true)]
async fn battery_is_read_through_the_mailbox() {
    let (_mock, driver, mut events) = connected_driver(Script::default());
    driver.connect().await.unwrap();
    drain(&mut events);

    driver.read_info(DeviceInfoKind::BatteryLevel).await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, DriverEvent::DeviceInfo(_))).await;
    assert!(matches!(event, DriverEvent::DeviceInfo(DeviceInfo::BatteryLevel(p)) if p == 50.0));
}

#[tokio::test(start_paused = true)]
async fn command_response_is_delivered_as_an_event() {
    let (_mock, driver, mut events) = connected_driver(Script::default());
    driver.connect().await.unwrap();

    driver.send_command(MailboxCommand::GetSystemStatus).await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, DriverEvent::CommandResponse { .. })).await;
    let DriverEvent::CommandResponse { command, response } = event else {
        unreachable!()
    };
    assert_eq!(command, MailboxCommand::GetSystemStatus);
    assert!(matches!(response, MailboxResponse::SystemStatus(s) if s.processor_ok && s.audio_ok));
}

#[tokio::test(start_paused = true)]
async fn unsolicited_mailbox_frames_surface_as_events() {
    let (mock, driver, mut events) = connected_driver(Script::default());
    driver.connect().await.unwrap();

    assert!(mock.send_mailbox(vec![opcode::LEAD_OFF_EVENT, 0b0000_0010]));

    let event = wait_for(&mut events, |e| matches!(e, DriverEvent::Mailbox(_))).await;
    assert!(matches!(
        event,
        DriverEvent::Mailbox(MailboxResponse::LeadOff { channel_mask: 0b10 })
    ));
}
