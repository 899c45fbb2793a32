//! Session manager integration tests against the emulated card.

mod common;

use std::sync::Arc;
use std::time::Duration;

use keycard_host::{CardState, Error, MockKeycard, SessionManager, SessionState, SignalBus};

use common::{wait_for_state, wait_until, SignalCapture};

const PIN: &str = "123456";
const PUK: &str = "123456123456";
const TIMEOUT: Duration = Duration::from_secs(5);

// Instruction bytes the transcript assertions look for.
const INS_SELECT: u8 = 0xA4;
const INS_OPEN_SC: u8 = 0x10;
const INS_PAIR: u8 = 0x12;
const INS_VERIFY_PIN: u8 = 0x20;
const INS_GET_STATUS: u8 = 0xF2;

fn seed() -> [u8; 64] {
    [0x42; 64]
}

struct Fixture {
    manager: SessionManager,
    channel: Arc<MockKeycard>,
    capture: SignalCapture,
    _dir: tempfile::TempDir,
}

fn start_session() -> Fixture {
    let signals = Arc::new(SignalBus::new());
    let capture = SignalCapture::install(&signals);
    let manager = SessionManager::new(signals);

    let channel = Arc::new(MockKeycard::new());
    channel.attach_reader();

    let dir = tempfile::tempdir().unwrap();
    manager
        .start(dir.path().join("pairings.json"), channel.clone())
        .unwrap();
    wait_for_state(&manager, SessionState::WaitingForCard, TIMEOUT);

    Fixture {
        manager,
        channel,
        capture,
        _dir: dir,
    }
}

fn count(ins: &[u8], wanted: u8) -> usize {
    ins.iter().filter(|&&b| b == wanted).count()
}

#[test]
fn connect_sequence_runs_once_per_insertion() {
    let fixture = start_session();
    fixture
        .channel
        .insert_card(CardState::with_keys(PIN, PUK, "KeycardDefaultPairing", &seed()));
    wait_for_state(&fixture.manager, SessionState::Ready, TIMEOUT);

    let ins = fixture.channel.transcript_ins();
    assert_eq!(ins.first(), Some(&INS_SELECT));
    assert_eq!(count(&ins, INS_SELECT), 1);
    assert_eq!(count(&ins, INS_OPEN_SC), 1);
    assert_eq!(count(&ins, INS_PAIR), 2, "two PAIR stages expected");

    // GET STATUS must be the first non-handshake command after the
    // channel opens; VERIFY PIN must never come first.
    let open_at = ins.iter().position(|&b| b == INS_OPEN_SC).unwrap();
    let status_at = ins.iter().position(|&b| b == INS_GET_STATUS).unwrap();
    assert!(status_at > open_at);
    assert!(
        !ins[open_at..status_at]
            .iter()
            .any(|&b| b == INS_VERIFY_PIN),
        "VERIFY PIN before GET STATUS"
    );

    // Follow-up operations reuse the same connection: no new SELECT,
    // PAIR or OPEN SECURE CHANNEL.
    fixture.manager.authorize(PIN).unwrap();
    fixture.manager.get_metadata().unwrap();
    let keys = fixture.manager.export_login_keys().unwrap();
    assert!(keys.whisper.private_key.is_some());

    let ins = fixture.channel.transcript_ins();
    assert_eq!(count(&ins, INS_SELECT), 1);
    assert_eq!(count(&ins, INS_OPEN_SC), 1);
    assert_eq!(count(&ins, INS_PAIR), 2);
}

#[test]
fn pairing_survives_restart_and_is_reused() {
    let fixture = start_session();
    fixture
        .channel
        .insert_card(CardState::with_keys(PIN, PUK, "KeycardDefaultPairing", &seed()));
    wait_for_state(&fixture.manager, SessionState::Ready, TIMEOUT);
    assert_eq!(count(&fixture.channel.transcript_ins(), INS_PAIR), 2);

    let storage_path = fixture._dir.path().join("pairings.json");
    let card = fixture.channel.remove_card().unwrap();
    fixture.manager.stop();

    // Same card, new process: the stored pairing must be reused without
    // a new PAIR handshake.
    let signals = Arc::new(SignalBus::new());
    let manager = SessionManager::new(signals);
    let channel = Arc::new(MockKeycard::new());
    channel.attach_reader();
    channel.insert_card(card);
    manager.start(&storage_path, channel.clone()).unwrap();
    wait_for_state(&manager, SessionState::Ready, TIMEOUT);

    assert_eq!(count(&channel.transcript_ins(), INS_PAIR), 0);
    manager.authorize(PIN).unwrap();
}

#[test]
fn same_uid_retap_is_ignored() {
    let fixture = start_session();
    fixture
        .channel
        .insert_card(CardState::with_keys(PIN, PUK, "KeycardDefaultPairing", &seed()));
    wait_for_state(&fixture.manager, SessionState::Ready, TIMEOUT);

    let status_changes = fixture.capture.of_type("status-changed").len();
    fixture.channel.clear_transcript();

    fixture.channel.retap();
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(fixture.manager.state(), SessionState::Ready);
    assert!(
        fixture.channel.transcript_ins().is_empty(),
        "re-tap must not reset the secure channel"
    );
    assert_eq!(
        fixture.capture.of_type("status-changed").len(),
        status_changes,
        "re-tap must not re-emit a connecting transition"
    );
}

#[test]
fn concurrent_operations_never_interleave_card_traffic() {
    let fixture = start_session();
    fixture
        .channel
        .insert_card(CardState::with_keys(PIN, PUK, "KeycardDefaultPairing", &seed()));
    wait_for_state(&fixture.manager, SessionState::Ready, TIMEOUT);
    fixture.manager.authorize(PIN).unwrap();

    // Hammer the facade from several threads. The operation mutex must
    // keep the secure-channel IV chain intact: any interleaving of APDU
    // sequences would desync it and every later operation would fail.
    let manager = Arc::new(fixture.manager);
    let mut handles = Vec::new();
    for worker in 0..3 {
        let manager = Arc::clone(&manager);
        handles.push(std::thread::spawn(move || {
            for _ in 0..5 {
                match worker {
                    0 => {
                        let _ = manager.authorize(PIN);
                    }
                    1 => {
                        manager.get_metadata().unwrap();
                    }
                    _ => {
                        let keys = manager.export_login_keys().unwrap();
                        assert!(keys.encryption.private_key.is_some());
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // The channel must still be fully usable afterwards.
    let recovered = manager.export_recover_keys().unwrap();
    assert!(recovered.wallet_root.chain_code.is_some());
    assert!(recovered.master.public_key.is_some());

    let ins = fixture.channel.transcript_ins();
    assert_eq!(count(&ins, INS_SELECT), 1, "command set must stay fresh");
}

#[test]
fn initialize_empty_card_reconnects_to_ready() {
    let fixture = start_session();
    fixture.channel.insert_card(CardState::pre_initialized());
    wait_for_state(&fixture.manager, SessionState::EmptyKeycard, TIMEOUT);

    fixture.manager.initialize(PIN, PUK, "").unwrap();

    // The session tears down and the forced re-scan drives a full
    // reconnect against the now-initialized card.
    wait_for_state(&fixture.manager, SessionState::Ready, TIMEOUT);
    fixture.manager.authorize(PIN).unwrap();
    assert_eq!(fixture.manager.state(), SessionState::Authorized);
}

#[test]
fn wrong_pin_reports_remaining_attempts() {
    let fixture = start_session();
    fixture
        .channel
        .insert_card(CardState::with_keys(PIN, PUK, "KeycardDefaultPairing", &seed()));
    wait_for_state(&fixture.manager, SessionState::Ready, TIMEOUT);

    let err = fixture.manager.authorize("000000").unwrap_err();
    assert!(matches!(err, Error::WrongPin { remaining: 2 }));
    assert!(
        fixture.manager.last_error().contains('2'),
        "last_error was {:?}",
        fixture.manager.last_error()
    );
    assert_eq!(fixture.manager.state(), SessionState::Ready);
}

#[test]
fn factory_reset_returns_card_to_empty() {
    let fixture = start_session();
    fixture
        .channel
        .insert_card(CardState::with_keys(PIN, PUK, "KeycardDefaultPairing", &seed()));
    wait_for_state(&fixture.manager, SessionState::Ready, TIMEOUT);

    fixture.manager.factory_reset().unwrap();
    wait_for_state(&fixture.manager, SessionState::EmptyKeycard, TIMEOUT);
    assert_eq!(
        fixture.channel.inspect_card(|card| card.key_uid_hex()),
        Some(String::new())
    );
}

#[test]
fn metadata_roundtrip_through_card() {
    let fixture = start_session();
    fixture
        .channel
        .insert_card(CardState::with_keys(PIN, PUK, "KeycardDefaultPairing", &seed()));
    wait_for_state(&fixture.manager, SessionState::Ready, TIMEOUT);
    fixture.manager.authorize(PIN).unwrap();

    let paths = vec![
        "m/44'/60'/0'/0/0".to_string(),
        "m/44'/60'/0'/0/1".to_string(),
        "m/44'/60'/0'/0/5".to_string(),
    ];
    fixture.manager.store_metadata("my wallet", &paths).unwrap();

    let metadata = fixture.manager.get_metadata().unwrap();
    assert_eq!(metadata.name, "my wallet");
    assert_eq!(metadata.wallet_paths(), paths);
}

#[test]
fn start_twice_is_rejected() {
    let fixture = start_session();
    let err = fixture
        .manager
        .start(fixture._dir.path().join("other.json"), fixture.channel.clone())
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyStarted));
}

#[test]
fn card_removal_returns_to_waiting() {
    let fixture = start_session();
    fixture
        .channel
        .insert_card(CardState::with_keys(PIN, PUK, "KeycardDefaultPairing", &seed()));
    wait_for_state(&fixture.manager, SessionState::Ready, TIMEOUT);

    fixture.channel.remove_card();
    wait_for_state(&fixture.manager, SessionState::WaitingForCard, TIMEOUT);

    // Re-insert: a fresh connect sequence must run.
    fixture.channel.clear_transcript();
    fixture
        .channel
        .insert_card(CardState::with_keys(PIN, PUK, "KeycardDefaultPairing", &seed()));
    wait_for_state(&fixture.manager, SessionState::Ready, TIMEOUT);
    wait_until(TIMEOUT, "fresh select recorded", || {
        count(&fixture.channel.transcript_ins(), INS_SELECT) == 1
    });
}
