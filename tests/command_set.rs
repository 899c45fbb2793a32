//! Command-set tests driving the emulated card directly, below the
//! session and flow facades.

use std::sync::Arc;

use keycard_host::{
    CardState, Channel, CommandSet, DerivationPath, Error, ExportOption, MockKeycard,
    DEFAULT_PAIRING_PASSWORD,
};

const PIN: &str = "123456";
const PUK: &str = "123456123456";

fn connected_command_set(card: CardState) -> (Arc<MockKeycard>, CommandSet) {
    let channel = Arc::new(MockKeycard::new());
    channel.attach_reader();
    channel.insert_card(card);
    channel.start_detection().unwrap();

    let mut cs = CommandSet::new(channel.clone());
    cs.select().unwrap();
    let pairing = cs.pair(DEFAULT_PAIRING_PASSWORD).unwrap();
    cs.open_secure_channel(&pairing).unwrap();
    cs.get_status().unwrap();
    (channel, cs)
}

fn wallet_path() -> DerivationPath {
    "m/44'/60'/0'/0/0".parse().unwrap()
}

#[test]
fn generate_key_creates_master_and_remove_key_wipes_it() {
    let (channel, mut cs) =
        connected_command_set(CardState::initialized(PIN, PUK, DEFAULT_PAIRING_PASSWORD));
    cs.verify_pin(PIN).unwrap();

    // No master key yet: exporting has nothing to derive from.
    assert!(cs
        .export_key(true, &wallet_path(), ExportOption::PublicOnly)
        .is_err());

    let key_uid = cs.generate_key().unwrap();
    assert_eq!(
        channel.inspect_card(|card| card.key_uid_hex()),
        Some(hex::encode(key_uid))
    );
    let status = cs.get_status().unwrap();
    assert!(status.key_initialized);

    let exported = cs
        .export_key(true, &wallet_path(), ExportOption::PrivateAndPublic)
        .unwrap();
    assert!(exported.private_key.is_some());
    assert!(exported.address().is_some());

    cs.remove_key().unwrap();
    let status = cs.get_status().unwrap();
    assert!(!status.key_initialized);
    assert_eq!(
        channel.inspect_card(|card| card.key_uid_hex()),
        Some(String::new())
    );
    assert!(cs
        .export_key(true, &wallet_path(), ExportOption::PublicOnly)
        .is_err());
}

#[test]
fn generate_key_overwrites_loaded_seed() {
    let seed = [0x5Au8; 64];
    let (channel, mut cs) = connected_command_set(CardState::with_keys(
        PIN,
        PUK,
        DEFAULT_PAIRING_PASSWORD,
        &seed,
    ));
    cs.verify_pin(PIN).unwrap();

    let before = channel.inspect_card(|card| card.key_uid_hex()).unwrap();
    let key_uid = cs.generate_key().unwrap();
    let after = channel.inspect_card(|card| card.key_uid_hex()).unwrap();

    assert_eq!(after, hex::encode(key_uid));
    assert_ne!(before, after, "a fresh key must replace the loaded seed");
}

#[test]
fn key_management_requires_verified_pin() {
    let seed = [0x5Au8; 64];
    let (_channel, mut cs) = connected_command_set(CardState::with_keys(
        PIN,
        PUK,
        DEFAULT_PAIRING_PASSWORD,
        &seed,
    ));

    // Secure channel is open but the PIN was never verified.
    let err = cs.remove_key().unwrap_err();
    assert!(matches!(err, Error::ConditionsNotSatisfied));
    let err = cs.generate_key().unwrap_err();
    assert!(matches!(err, Error::ConditionsNotSatisfied));
}
