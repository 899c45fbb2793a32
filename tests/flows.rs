//! Flow engine integration tests against the emulated card.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use keycard_host::{CardState, Error, FlowEngine, FlowState, FlowType, MockKeycard, SignalBus};

use common::{wait_until, SignalCapture};

const PIN: &str = "000000";
const PUK: &str = "123456123456";
const TIMEOUT: Duration = Duration::from_secs(5);
const MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn seed() -> [u8; 64] {
    [0x11; 64]
}

struct Fixture {
    engine: FlowEngine,
    channel: Arc<MockKeycard>,
    capture: SignalCapture,
    _dir: tempfile::TempDir,
}

fn start_engine(card: Option<CardState>) -> Fixture {
    let signals = Arc::new(SignalBus::new());
    let capture = SignalCapture::install(&signals);
    let engine = FlowEngine::new(signals);

    let channel = Arc::new(MockKeycard::new());
    channel.attach_reader();
    if let Some(card) = card {
        channel.insert_card(card);
    }

    let dir = tempfile::tempdir().unwrap();
    engine
        .init(dir.path().join("pairings.json"), channel.clone())
        .unwrap();
    engine.start_continuous_detection().unwrap();

    Fixture {
        engine,
        channel,
        capture,
        _dir: dir,
    }
}

fn wait_for_idle(engine: &FlowEngine) {
    wait_until(TIMEOUT, "engine back to idle", || {
        engine.state() == FlowState::Idle
    });
}

#[test]
fn login_flow_exports_whisper_and_encryption_keys() {
    let fixture = start_engine(Some(CardState::with_keys(
        PIN,
        PUK,
        "KeycardDefaultPairing",
        &seed(),
    )));

    fixture
        .engine
        .start_flow(
            FlowType::Login.code(),
            json!({"pin": PIN, "pairing-pass": "KeycardDefaultPairing"}),
        )
        .unwrap();

    let result = fixture.capture.wait_for("flow-result", TIMEOUT);
    wait_for_idle(&fixture.engine);

    assert_eq!(fixture.capture.of_type("flow-result").len(), 1);
    assert!(result["key-uid"].as_str().is_some_and(|s| !s.is_empty()));
    for key in ["whisper-key", "encryption-key"] {
        let private = result[key]["private-key"].as_str().unwrap();
        assert!(private.starts_with("0x") && private.len() > 2, "{key}");
    }
}

#[test]
fn load_account_initializes_and_loads_generated_mnemonic() {
    let fixture = start_engine(Some(CardState::pre_initialized()));

    fixture
        .engine
        .start_flow(
            FlowType::LoadAccount.code(),
            json!({"mnemonic-length": 12, "new-pin": PIN, "new-puk": PUK}),
        )
        .unwrap();

    // Pre-initialized card: the flow pauses asking for initialization.
    let event = fixture.capture.wait_for("enter-new-pin", TIMEOUT);
    assert_eq!(event["error"], "require-init");

    // Credentials were already in the start parameters.
    wait_until(TIMEOUT, "flow paused", || {
        fixture.engine.state() == FlowState::Paused
    });
    fixture.engine.resume_flow(json!({})).unwrap();

    // After INIT and re-detection, the mnemonic prompt follows.
    let event = fixture.capture.wait_for("enter-mnemonic", TIMEOUT);
    assert_eq!(event["error"], "loading-keys");
    let indexes = event["mnemonic-indexes"].as_array().unwrap();
    assert_eq!(indexes.len(), 12);
    for index in indexes {
        let index = index.as_u64().unwrap();
        assert!(index < 2048);
    }

    wait_until(TIMEOUT, "flow paused again", || {
        fixture.engine.state() == FlowState::Paused
    });
    fixture
        .engine
        .resume_flow(json!({ "mnemonic": MNEMONIC }))
        .unwrap();

    let result = fixture.capture.wait_for("flow-result", TIMEOUT);
    let key_uid = result["key-uid"].as_str().unwrap();
    assert_eq!(key_uid.len(), 2 + 64, "32-byte key UID expected");
    wait_for_idle(&fixture.engine);
}

#[test]
fn cancel_while_waiting_for_card_returns_to_idle() {
    let fixture = start_engine(None);

    fixture
        .engine
        .start_flow(FlowType::GetAppInfo.code(), json!({}))
        .unwrap();
    fixture.capture.wait_for("insert-card", TIMEOUT);

    let before_cancel = Instant::now();
    fixture.engine.cancel_flow().unwrap();
    assert!(
        before_cancel.elapsed() < Duration::from_millis(200),
        "cancel took {:?}",
        before_cancel.elapsed()
    );
    assert_eq!(fixture.engine.state(), FlowState::Idle);

    // No further signals after cancellation, in particular no result.
    let seen = fixture.capture.count();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(fixture.capture.count(), seen);
    assert!(fixture.capture.of_type("flow-result").is_empty());
}

#[test]
fn concurrent_starts_admit_exactly_one_flow() {
    let fixture = start_engine(None);
    let engine = Arc::new(fixture.engine);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            engine.start_flow(FlowType::GetAppInfo.code(), json!({}))
        }));
    }
    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(Error::FlowAlreadyRunning))));

    engine.cancel_flow().unwrap();
}

#[test]
fn swap_card_restart_reruns_flow_from_top() {
    // A card without keys cannot log in; the flow asks for a swap and
    // restarts once a suitable card arrives.
    let fixture = start_engine(Some(CardState::initialized(
        PIN,
        PUK,
        "KeycardDefaultPairing",
    )));

    fixture
        .engine
        .start_flow(FlowType::Login.code(), json!({"pin": PIN}))
        .unwrap();

    let event = fixture.capture.wait_for("swap-card", TIMEOUT);
    assert_eq!(event["error"], "no-keys");

    fixture.channel.remove_card();
    fixture.channel.insert_card(CardState::with_keys(
        PIN,
        PUK,
        "KeycardDefaultPairing",
        &seed(),
    ));
    wait_until(TIMEOUT, "flow paused for swap", || {
        fixture.engine.state() == FlowState::Paused
    });
    fixture.engine.resume_flow(json!({})).unwrap();

    let result = fixture.capture.wait_for("flow-result", TIMEOUT);
    assert!(result["whisper-key"]["private-key"].as_str().is_some());
    assert_eq!(fixture.capture.of_type("flow-result").len(), 1);
    wait_for_idle(&fixture.engine);
}

#[test]
fn get_app_info_reports_retry_counters_when_paired() {
    let fixture = start_engine(Some(CardState::with_keys(
        PIN,
        PUK,
        "KeycardDefaultPairing",
        &seed(),
    )));

    fixture
        .engine
        .start_flow(FlowType::GetAppInfo.code(), json!({"pin": PIN}))
        .unwrap();

    let result = fixture.capture.wait_for("flow-result", TIMEOUT);
    assert_eq!(result["error"], "ok");
    assert_eq!(result["paired"], true);
    assert_eq!(result["pin-retries"], 3);
    assert_eq!(result["puk-retries"], 5);
    assert!(result["app-info"]["initialized"].as_bool().unwrap());
    wait_for_idle(&fixture.engine);
}

#[test]
fn get_app_info_factory_reset_emits_result_before_redetection() {
    let fixture = start_engine(Some(CardState::with_keys(
        PIN,
        PUK,
        "KeycardDefaultPairing",
        &seed(),
    )));

    fixture
        .engine
        .start_flow(FlowType::GetAppInfo.code(), json!({"factory reset": true}))
        .unwrap();

    let result = fixture.capture.wait_for("flow-result", TIMEOUT);
    assert_eq!(result["error"], "ok");
    assert_eq!(result["factory-reset"], true);
    assert_eq!(
        fixture.channel.inspect_card(|card| card.key_uid_hex()),
        Some(String::new())
    );
    wait_for_idle(&fixture.engine);
}

#[test]
fn sign_flow_returns_recoverable_signature() {
    let fixture = start_engine(Some(CardState::with_keys(
        PIN,
        PUK,
        "KeycardDefaultPairing",
        &seed(),
    )));

    let hash = format!("0x{}", "ab".repeat(32));
    fixture
        .engine
        .start_flow(
            FlowType::Sign.code(),
            json!({"pin": PIN, "tx-hash": hash, "bip44-path": "m/44'/60'/0'/0/0"}),
        )
        .unwrap();

    let result = fixture.capture.wait_for("flow-result", TIMEOUT);
    let signature = &result["tx-signature"];
    assert_eq!(signature["r"].as_str().unwrap().len(), 2 + 64);
    assert_eq!(signature["s"].as_str().unwrap().len(), 2 + 64);
    assert!(signature["v"].as_u64().unwrap() < 2);
    wait_for_idle(&fixture.engine);
}

#[test]
fn change_pin_flow_pauses_for_missing_value() {
    let fixture = start_engine(Some(CardState::with_keys(
        PIN,
        PUK,
        "KeycardDefaultPairing",
        &seed(),
    )));

    fixture
        .engine
        .start_flow(FlowType::ChangePin.code(), json!({"pin": PIN}))
        .unwrap();

    fixture.capture.wait_for("enter-new-pin", TIMEOUT);
    wait_until(TIMEOUT, "flow paused", || {
        fixture.engine.state() == FlowState::Paused
    });
    fixture
        .engine
        .resume_flow(json!({"new-pin": "654321"}))
        .unwrap();

    fixture.capture.wait_for("flow-result", TIMEOUT);
    wait_for_idle(&fixture.engine);

    // The next flow must authenticate with the new PIN.
    fixture
        .engine
        .start_flow(FlowType::GetAppInfo.code(), json!({"pin": "654321"}))
        .unwrap();
    let result = fixture.capture.wait_for_nth("flow-result", 1, TIMEOUT);
    assert_eq!(result["paired"], true);
    wait_for_idle(&fixture.engine);
}

#[test]
fn export_public_mirrors_input_shape() {
    let fixture = start_engine(Some(CardState::with_keys(
        PIN,
        PUK,
        "KeycardDefaultPairing",
        &seed(),
    )));

    fixture
        .engine
        .start_flow(
            FlowType::ExportPublic.code(),
            json!({"pin": PIN, "bip44-path": ["m/44'/60'/0'/0/0", "m/44'/60'/0'/0/1"]}),
        )
        .unwrap();

    let result = fixture.capture.wait_for("flow-result", TIMEOUT);
    let exported = result["exported-key"].as_array().unwrap();
    assert_eq!(exported.len(), 2);
    for key in exported {
        assert!(key["public-key"].as_str().unwrap().starts_with("0x"));
        assert!(key.get("private-key").is_none());
    }
    wait_for_idle(&fixture.engine);
}

#[test]
fn metadata_flows_roundtrip() {
    let fixture = start_engine(Some(CardState::with_keys(
        PIN,
        PUK,
        "KeycardDefaultPairing",
        &seed(),
    )));

    fixture
        .engine
        .start_flow(
            FlowType::StoreMetadata.code(),
            json!({
                "pin": PIN,
                "card-name": "travel card",
                "paths": ["m/44'/60'/0'/0/0", "m/44'/60'/0'/0/1", "m/44'/60'/0'/0/7"],
            }),
        )
        .unwrap();
    let stored = fixture.capture.wait_for("flow-result", TIMEOUT);
    assert_eq!(stored["error"], "ok");
    wait_for_idle(&fixture.engine);

    fixture
        .engine
        .start_flow(FlowType::GetMetadata.code(), json!({}))
        .unwrap();
    let result = fixture.capture.wait_for_nth("flow-result", 1, TIMEOUT);
    assert_eq!(result["error"], "ok");
    assert_eq!(result["card-metadata"]["name"], "travel card");
    let paths = result["card-metadata"]["paths"].as_array().unwrap();
    assert_eq!(paths.len(), 3);
    assert_eq!(paths[2], "m/44'/60'/0'/0/7");
    wait_for_idle(&fixture.engine);
}

#[test]
fn unknown_flow_code_is_rejected() {
    let fixture = start_engine(None);
    let err = fixture.engine.start_flow(42, json!({})).unwrap_err();
    assert!(matches!(err, Error::UnknownFlow(42)));
    assert_eq!(fixture.engine.state(), FlowState::Idle);
}
