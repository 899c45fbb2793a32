//! In-process Keycard emulator implementing the [`Channel`] contract.
//!
//! `MockKeycard` plays the card side of the applet protocol, including the
//! secure channel crypto, so the session manager and flow engine can be
//! exercised end-to-end without a reader. Test controls simulate reader
//! attachment, card taps and removals, and the emulator records a
//! transcript of every transmitted APDU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use k256::ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

use super::{Channel, ChannelEvent, ChannelState, EventSinks};
use crate::apdu::{status, Command, Response, StatusWord};
use crate::constants::{ins, tags, CLA_ISO7816, PIN_LENGTH, PUK_LENGTH};
use crate::crypto::{
    calculate_cryptogram, calculate_mac, decrypt_data, derive_session_keys, encrypt_data,
    generate_ecdh_shared_secret, generate_pairing_token, ApduMeta, Challenge, ScpIv, ScpKey,
};
use crate::types::encode_tlv;
use crate::{Error, Result};

const MAX_PIN_RETRIES: u8 = 3;
const MAX_PUK_RETRIES: u8 = 5;
const CAPABILITIES_ALL: u8 = 0x0F;

/// Simulated applet state for one card.
pub struct CardState {
    secret_key: SecretKey,
    initialized: bool,
    instance_uid: [u8; 16],
    pin: String,
    puk: String,
    pairing_token: Challenge,
    pin_retries: u8,
    puk_retries: u8,
    max_pairing_slots: u8,
    pairings: HashMap<u8, [u8; 32]>,
    master_secret: Option<[u8; 32]>,
    key_uid: Vec<u8>,
    data_slots: HashMap<u8, Vec<u8>>,

    // volatile, lost on power-down
    selected: bool,
    pin_verified: bool,
    pair_challenge: Option<Challenge>,
    session: Option<CardSession>,
}

struct CardSession {
    enc: ScpKey,
    mac: ScpKey,
    iv: ScpIv,
}

impl CardState {
    /// A card with the applet installed but no credentials yet.
    pub fn pre_initialized() -> Self {
        Self {
            secret_key: SecretKey::random(&mut rand::thread_rng()),
            initialized: false,
            instance_uid: [0; 16],
            pin: String::new(),
            puk: String::new(),
            pairing_token: Challenge::default(),
            pin_retries: MAX_PIN_RETRIES,
            puk_retries: MAX_PUK_RETRIES,
            max_pairing_slots: 5,
            pairings: HashMap::new(),
            master_secret: None,
            key_uid: Vec::new(),
            data_slots: HashMap::new(),
            selected: false,
            pin_verified: false,
            pair_challenge: None,
            session: None,
        }
    }

    /// An initialized card with no keys loaded.
    pub fn initialized(pin: &str, puk: &str, pairing_password: &str) -> Self {
        let mut card = Self::pre_initialized();
        card.apply_init(pin, puk, &generate_pairing_token(pairing_password));
        card
    }

    /// An initialized card carrying a master key derived from `seed`.
    pub fn with_keys(pin: &str, puk: &str, pairing_password: &str, seed: &[u8; 64]) -> Self {
        let mut card = Self::initialized(pin, puk, pairing_password);
        card.load_seed(seed);
        card
    }

    /// Lowercase hex UID this card reports on detection.
    pub fn uid(&self) -> String {
        hex::encode(&self.instance_uid[..2])
    }

    /// Hex of the current key UID (empty when no key is loaded).
    pub fn key_uid_hex(&self) -> String {
        hex::encode(&self.key_uid)
    }

    /// Number of occupied pairing slots.
    pub fn paired_slots(&self) -> usize {
        self.pairings.len()
    }

    fn apply_init(&mut self, pin: &str, puk: &str, token: &Challenge) {
        self.initialized = true;
        rand::thread_rng().fill_bytes(&mut self.instance_uid);
        self.pin = pin.to_string();
        self.puk = puk.to_string();
        self.pairing_token = *token;
        self.pin_retries = MAX_PIN_RETRIES;
        self.puk_retries = MAX_PUK_RETRIES;
        self.pairings.clear();
        self.reset_volatile();
    }

    fn reset_volatile(&mut self) {
        self.selected = false;
        self.pin_verified = false;
        self.pair_challenge = None;
        self.session = None;
    }

    fn load_seed(&mut self, seed: &[u8; 64]) {
        self.set_master(Sha256::digest(seed).into());
    }

    fn set_master(&mut self, master: [u8; 32]) {
        self.master_secret = Some(master);
        let public = derived_key(&master, &[]).public_key();
        self.key_uid = Sha256::digest(public.to_encoded_point(false).as_bytes()).to_vec();
    }

    fn remaining_slots(&self) -> u8 {
        self.max_pairing_slots - self.pairings.len() as u8
    }
}

// Deterministic per-path key material for the emulator. This is not BIP32
// derivation; the host never checks the math, only key validity.
fn derived_key(master: &[u8; 32], path_bytes: &[u8]) -> SecretKey {
    let mut input = Vec::with_capacity(33 + path_bytes.len());
    input.push(0x00);
    input.extend_from_slice(master);
    input.extend_from_slice(path_bytes);
    loop {
        let candidate: [u8; 32] = Sha256::digest(&input).into();
        match SecretKey::from_slice(&candidate) {
            Ok(key) => return key,
            Err(_) => input = candidate.to_vec(),
        }
    }
}

fn derived_chain_code(master: &[u8; 32], path_bytes: &[u8]) -> [u8; 32] {
    let mut input = Vec::with_capacity(33 + path_bytes.len());
    input.push(0x01);
    input.extend_from_slice(master);
    input.extend_from_slice(path_bytes);
    Sha256::digest(&input).into()
}

struct MockInner {
    sinks: EventSinks,
    ui_state: Mutex<ChannelState>,
    detecting: AtomicBool,
    reader_available: AtomicBool,
    connected: AtomicBool,
    card: Mutex<Option<CardState>>,
    txn: Mutex<()>,
    transcript: Mutex<Vec<Vec<u8>>>,
}

/// Emulated channel plus applet. Clone-cheap via `Arc`.
#[derive(Clone)]
pub struct MockKeycard {
    inner: Arc<MockInner>,
}

impl Default for MockKeycard {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKeycard {
    /// A channel with no reader attached yet.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                sinks: EventSinks::new(),
                ui_state: Mutex::new(ChannelState::Idle),
                detecting: AtomicBool::new(false),
                reader_available: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                card: Mutex::new(None),
                txn: Mutex::new(()),
                transcript: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A channel with a reader attached and the given card already present.
    pub fn with_card(card: CardState) -> Self {
        let channel = Self::new();
        channel.attach_reader();
        channel.insert_card(card);
        channel
    }

    /// Simulate a reader appearing.
    pub fn attach_reader(&self) {
        self.inner.reader_available.store(true, Ordering::SeqCst);
        if self.inner.detecting.load(Ordering::SeqCst) {
            self.inner
                .sinks
                .publish(ChannelEvent::ReaderAvailabilityChanged(true));
        }
    }

    /// Simulate the last reader vanishing.
    pub fn detach_reader(&self) {
        self.inner.reader_available.store(false, Ordering::SeqCst);
        if self.inner.detecting.load(Ordering::SeqCst) {
            self.inner
                .sinks
                .publish(ChannelEvent::ReaderAvailabilityChanged(false));
        }
    }

    /// Simulate a card tap; fires `TargetDetected` when detection is armed.
    pub fn insert_card(&self, card: CardState) {
        let uid = card.uid();
        *self.inner.card.lock().unwrap() = Some(card);
        if self.inner.detecting.load(Ordering::SeqCst) {
            self.inner.connected.store(true, Ordering::SeqCst);
            self.inner
                .sinks
                .publish(ChannelEvent::TargetDetected { uid });
        }
    }

    /// Simulate the card leaving the field.
    pub fn remove_card(&self) -> Option<CardState> {
        let mut slot = self.inner.card.lock().unwrap();
        let mut card = slot.take();
        if let Some(card) = card.as_mut() {
            card.reset_volatile();
        }
        drop(slot);
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.sinks.publish(ChannelEvent::TargetLost);
        card
    }

    /// Re-emit `TargetDetected` for the present card without tearing the
    /// connection down, as a buggy reader stack or an NFC auto-resume
    /// would.
    pub fn retap(&self) {
        let uid = self
            .inner
            .card
            .lock()
            .unwrap()
            .as_ref()
            .map(CardState::uid);
        if let Some(uid) = uid {
            self.inner
                .sinks
                .publish(ChannelEvent::TargetDetected { uid });
        }
    }

    /// Inspect the present card.
    pub fn inspect_card<T>(&self, f: impl FnOnce(&CardState) -> T) -> Option<T> {
        self.inner.card.lock().unwrap().as_ref().map(f)
    }

    /// Instruction bytes of every APDU transmitted so far.
    pub fn transcript_ins(&self) -> Vec<u8> {
        self.inner
            .transcript
            .lock()
            .unwrap()
            .iter()
            .filter(|apdu| apdu.len() > 1)
            .map(|apdu| apdu[1])
            .collect()
    }

    /// Forget the recorded transcript.
    pub fn clear_transcript(&self) {
        self.inner.transcript.lock().unwrap().clear();
    }
}

impl Channel for MockKeycard {
    fn start_detection(&self) -> Result<()> {
        self.inner.detecting.store(true, Ordering::SeqCst);
        let available = self.inner.reader_available.load(Ordering::SeqCst);
        self.inner
            .sinks
            .publish(ChannelEvent::ReaderAvailabilityChanged(available));

        let uid = self
            .inner
            .card
            .lock()
            .unwrap()
            .as_ref()
            .map(CardState::uid);
        if let Some(uid) = uid {
            if !self.inner.connected.swap(true, Ordering::SeqCst) {
                self.inner
                    .sinks
                    .publish(ChannelEvent::TargetDetected { uid });
            }
        }
        Ok(())
    }

    fn stop_detection(&self) {
        self.inner.detecting.store(false, Ordering::SeqCst);
    }

    fn subscribe(&self) -> Receiver<ChannelEvent> {
        self.inner.sinks.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
            && self.inner.card.lock().unwrap().is_some()
    }

    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>> {
        // One APDU exchange at a time, like a real reader.
        let _txn = self.inner.txn.lock().unwrap();
        // A small card "round-trip" keeps concurrency bugs observable.
        std::thread::sleep(Duration::from_millis(1));

        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(Error::transport("no card in field"));
        }
        let mut card = self.inner.card.lock().unwrap();
        let card = card
            .as_mut()
            .ok_or_else(|| Error::transport("no card in field"))?;

        self.inner.transcript.lock().unwrap().push(apdu.to_vec());
        Ok(process_apdu(card, apdu))
    }

    fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(card) = self.inner.card.lock().unwrap().as_mut() {
            card.reset_volatile();
        }
    }

    fn force_scan(&self) {
        self.disconnect();
        if !self.inner.detecting.load(Ordering::SeqCst) {
            return;
        }
        let uid = self
            .inner
            .card
            .lock()
            .unwrap()
            .as_ref()
            .map(CardState::uid);
        if let Some(uid) = uid {
            self.inner.connected.store(true, Ordering::SeqCst);
            self.inner
                .sinks
                .publish(ChannelEvent::TargetDetected { uid });
        }
    }

    fn state(&self) -> ChannelState {
        *self.inner.ui_state.lock().unwrap()
    }

    fn set_state(&self, state: ChannelState) {
        *self.inner.ui_state.lock().unwrap() = state;
    }
}

fn sw_only(sw: u16) -> Vec<u8> {
    Response::new(Vec::new(), StatusWord::from(sw)).to_bytes().to_vec()
}

fn ok_with(payload: Vec<u8>) -> Vec<u8> {
    Response::new(payload, StatusWord::from(status::SW_OK))
        .to_bytes()
        .to_vec()
}

fn process_apdu(card: &mut CardState, apdu: &[u8]) -> Vec<u8> {
    let command = match Command::from_bytes(apdu) {
        Ok(command) => command,
        Err(_) => return sw_only(status::SW_WRONG_DATA),
    };

    if command.class() == CLA_ISO7816 && command.instruction() == ins::SELECT {
        return select(card);
    }
    if !card.selected {
        return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
    }

    match command.instruction() {
        ins::PAIR => pair(card, &command),
        ins::OPEN_SECURE_CHANNEL => open_secure_channel(card, &command),
        ins::INIT => init(card, &command),
        ins::FACTORY_RESET => factory_reset(card, &command),
        ins::GET_DATA if card.session.is_none() => {
            ok_with(card.data_slots.get(&command.p1()).cloned().unwrap_or_default())
        }
        _ => match card.session.is_some() {
            true => protected_exchange(card, &command),
            false => sw_only(status::SW_SECURITY_STATUS_NOT_SATISFIED),
        },
    }
}

fn select(card: &mut CardState) -> Vec<u8> {
    card.reset_volatile();
    card.selected = true;

    let public = card.secret_key.public_key();
    let public_bytes = public.to_encoded_point(false).as_bytes().to_vec();

    if !card.initialized {
        return ok_with(encode_tlv(tags::ECC_PUBLIC_KEY, &public_bytes));
    }

    let mut content = Vec::new();
    content.extend_from_slice(&encode_tlv(tags::INSTANCE_UID, &card.instance_uid));
    content.extend_from_slice(&encode_tlv(tags::ECC_PUBLIC_KEY, &public_bytes));
    content.extend_from_slice(&encode_tlv(tags::OTHER, &[3, 1]));
    content.extend_from_slice(&encode_tlv(tags::OTHER, &[card.remaining_slots()]));
    content.extend_from_slice(&encode_tlv(tags::KEY_UID, &card.key_uid));
    content.extend_from_slice(&encode_tlv(tags::CAPABILITIES, &[CAPABILITIES_ALL]));
    ok_with(encode_tlv(tags::TEMPLATE_APPLICATION_INFO, &content))
}

fn pair(card: &mut CardState, command: &Command) -> Vec<u8> {
    if card.session.is_some() {
        return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
    }
    if !card.initialized {
        return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
    }

    match command.p1() {
        0x00 => {
            if card.remaining_slots() == 0 {
                return sw_only(status::SW_FILE_FULL);
            }
            if command.data().len() != 32 {
                return sw_only(status::SW_WRONG_DATA);
            }
            let client_challenge = Challenge::clone_from_slice(command.data());
            let cryptogram = calculate_cryptogram(&card.pairing_token, &client_challenge);

            let mut card_challenge = Challenge::default();
            rand::thread_rng().fill_bytes(&mut card_challenge);
            card.pair_challenge = Some(card_challenge);

            let mut payload = cryptogram.to_vec();
            payload.extend_from_slice(&card_challenge);
            ok_with(payload)
        }
        0x01 => {
            let card_challenge = match card.pair_challenge.take() {
                Some(challenge) => challenge,
                None => return sw_only(status::SW_INCORRECT_P1P2),
            };
            let expected = calculate_cryptogram(&card.pairing_token, &card_challenge);
            if command.data() != expected.as_slice() {
                return sw_only(status::SW_SECURITY_STATUS_NOT_SATISFIED);
            }

            let index = match (0..card.max_pairing_slots).find(|i| !card.pairings.contains_key(i)) {
                Some(index) => index,
                None => return sw_only(status::SW_FILE_FULL),
            };
            let mut salt = Challenge::default();
            rand::thread_rng().fill_bytes(&mut salt);

            let mut hasher = Sha256::new();
            hasher.update(card.pairing_token);
            hasher.update(salt);
            card.pairings.insert(index, hasher.finalize().into());

            let mut payload = vec![index];
            payload.extend_from_slice(&salt);
            ok_with(payload)
        }
        _ => sw_only(status::SW_INCORRECT_P1P2),
    }
}

fn open_secure_channel(card: &mut CardState, command: &Command) -> Vec<u8> {
    let pairing_key = match card.pairings.get(&command.p1()) {
        Some(key) => *key,
        None => return sw_only(status::SW_INCORRECT_P1P2),
    };
    let host_public = match PublicKey::from_sec1_bytes(command.data()) {
        Ok(key) => key,
        Err(_) => return sw_only(status::SW_WRONG_DATA),
    };

    let mut salt = Challenge::default();
    rand::thread_rng().fill_bytes(&mut salt);
    let mut iv = ScpIv::default();
    rand::thread_rng().fill_bytes(&mut iv);

    let shared = generate_ecdh_shared_secret(&card.secret_key, &host_public);
    let (enc, mac) = derive_session_keys(&shared, &pairing_key, &salt);
    card.session = Some(CardSession { enc, mac, iv });
    card.pin_verified = false;

    let mut payload = salt.to_vec();
    payload.extend_from_slice(&iv);
    ok_with(payload)
}

fn init(card: &mut CardState, command: &Command) -> Vec<u8> {
    if card.initialized {
        return sw_only(status::SW_INS_NOT_SUPPORTED);
    }

    let data = command.data();
    if data.len() < 1 + 65 + 16 + 16 {
        return sw_only(status::SW_WRONG_DATA);
    }
    let key_len = data[0] as usize;
    if key_len != 65 || data.len() < 1 + key_len + 16 {
        return sw_only(status::SW_WRONG_DATA);
    }
    let host_public = match PublicKey::from_sec1_bytes(&data[1..1 + key_len]) {
        Ok(key) => key,
        Err(_) => return sw_only(status::SW_WRONG_DATA),
    };
    let iv = ScpIv::clone_from_slice(&data[1 + key_len..1 + key_len + 16]);
    let ciphertext = &data[1 + key_len + 16..];

    let shared = generate_ecdh_shared_secret(&card.secret_key, &host_public);
    let mut buf = BytesMut::from(ciphertext);
    let plain = match decrypt_data(&mut buf, shared.raw_secret_bytes(), &iv) {
        Ok(plain) => plain,
        Err(_) => return sw_only(status::SW_WRONG_DATA),
    };
    if plain.len() != PIN_LENGTH + PUK_LENGTH + 32 {
        return sw_only(status::SW_WRONG_DATA);
    }

    let pin = String::from_utf8_lossy(&plain[..PIN_LENGTH]).into_owned();
    let puk = String::from_utf8_lossy(&plain[PIN_LENGTH..PIN_LENGTH + PUK_LENGTH]).into_owned();
    let token = Challenge::clone_from_slice(&plain[PIN_LENGTH + PUK_LENGTH..]);
    card.apply_init(&pin, &puk, &token);
    // SELECT state survives INIT on the real applet.
    card.selected = true;
    ok_with(Vec::new())
}

fn factory_reset(card: &mut CardState, command: &Command) -> Vec<u8> {
    if command.p1() != 0xAA || command.p2() != 0x55 {
        return sw_only(status::SW_INCORRECT_P1P2);
    }
    card.initialized = false;
    card.instance_uid = [0; 16];
    card.pin.clear();
    card.puk.clear();
    card.pairing_token = Challenge::default();
    card.pairings.clear();
    card.master_secret = None;
    card.key_uid.clear();
    card.data_slots.clear();
    card.reset_volatile();
    card.selected = true;
    ok_with(Vec::new())
}

fn protected_exchange(card: &mut CardState, command: &Command) -> Vec<u8> {
    // Unwrap: verify the command MAC, decrypt the payload with the chained
    // IV, then advance the chain to the command MAC.
    let data = command.data();
    if data.len() < 16 {
        return sw_only(status::SW_WRONG_DATA);
    }
    let (received_mac, ciphertext) = data.split_at(16);

    let (plain, command_mac) = {
        let session = card.session.as_ref().unwrap();

        let mut meta = ApduMeta::default();
        meta[0] = command.class();
        meta[1] = command.instruction();
        meta[2] = command.p1();
        meta[3] = command.p2();
        meta[4] = data.len() as u8;

        let expected = calculate_mac(&meta, ciphertext, &session.mac);
        if received_mac != expected.as_slice() {
            return sw_only(status::SW_SECURITY_STATUS_NOT_SATISFIED);
        }

        let mut buf = BytesMut::from(ciphertext);
        match decrypt_data(&mut buf, &session.enc, &session.iv) {
            Ok(plain) => (plain, expected),
            Err(_) => return sw_only(status::SW_WRONG_DATA),
        }
    };

    let inner = Command::new(
        command.class(),
        command.instruction(),
        command.p1(),
        command.p2(),
    )
    .with_data(plain.to_vec());
    let response = dispatch_protected(card, &inner);

    // Wrap: encrypt with the command MAC as IV, then chain to the
    // response MAC.
    let session = card.session.as_mut().unwrap();
    session.iv = command_mac;

    let mut buf = BytesMut::from(&response[..]);
    let encrypted = encrypt_data(&mut buf, &session.enc, &session.iv);

    let mut meta = ApduMeta::default();
    meta[0] = (encrypted.len() + 16) as u8;
    let response_mac = calculate_mac(&meta, &encrypted, &session.mac);
    session.iv = response_mac;

    let mut payload = response_mac.to_vec();
    payload.extend_from_slice(&encrypted);
    ok_with(payload)
}

fn dispatch_protected(card: &mut CardState, command: &Command) -> Vec<u8> {
    match command.instruction() {
        ins::MUTUALLY_AUTHENTICATE => {
            let mut challenge = Challenge::default();
            rand::thread_rng().fill_bytes(&mut challenge);
            ok_with(challenge.to_vec())
        }
        ins::VERIFY_PIN => {
            if command.data() == card.pin.as_bytes() {
                card.pin_verified = true;
                card.pin_retries = MAX_PIN_RETRIES;
                ok_with(Vec::new())
            } else {
                card.pin_retries = card.pin_retries.saturating_sub(1);
                sw_only(0x63C0 | card.pin_retries as u16)
            }
        }
        ins::CHANGE_PIN => {
            if !card.pin_verified {
                return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
            }
            match command.p1() {
                0x00 => card.pin = String::from_utf8_lossy(command.data()).into_owned(),
                0x01 => card.puk = String::from_utf8_lossy(command.data()).into_owned(),
                0x02 => {
                    if command.data().len() != 32 {
                        return sw_only(status::SW_WRONG_DATA);
                    }
                    card.pairing_token = Challenge::clone_from_slice(command.data());
                }
                _ => return sw_only(status::SW_INCORRECT_P1P2),
            }
            ok_with(Vec::new())
        }
        ins::UNBLOCK_PIN => {
            let data = command.data();
            if data.len() != PUK_LENGTH + PIN_LENGTH {
                return sw_only(status::SW_WRONG_DATA);
            }
            if &data[..PUK_LENGTH] == card.puk.as_bytes() {
                card.pin = String::from_utf8_lossy(&data[PUK_LENGTH..]).into_owned();
                card.pin_retries = MAX_PIN_RETRIES;
                card.puk_retries = MAX_PUK_RETRIES;
                ok_with(Vec::new())
            } else {
                card.puk_retries = card.puk_retries.saturating_sub(1);
                sw_only(0x63C0 | card.puk_retries as u16)
            }
        }
        ins::GET_STATUS => match command.p1() {
            0x00 => {
                let mut content = Vec::new();
                content.extend_from_slice(&encode_tlv(tags::OTHER, &[card.pin_retries]));
                content.extend_from_slice(&encode_tlv(tags::OTHER, &[card.puk_retries]));
                let key_flag = if card.master_secret.is_some() { 0xFF } else { 0x00 };
                content.extend_from_slice(&encode_tlv(tags::KEY_INITIALIZED, &[key_flag]));
                ok_with(encode_tlv(tags::TEMPLATE_APPLICATION_STATUS, &content))
            }
            0x01 => ok_with(Vec::new()),
            _ => sw_only(status::SW_INCORRECT_P1P2),
        },
        ins::GENERATE_MNEMONIC => {
            let checksum = command.p1();
            if !(4..=8).contains(&checksum) {
                return sw_only(status::SW_INCORRECT_P1P2);
            }
            let mut rng = rand::thread_rng();
            let mut payload = Vec::with_capacity(checksum as usize * 3 * 2);
            for _ in 0..checksum as usize * 3 {
                let index: u16 = rng.gen_range(0..2048);
                payload.extend_from_slice(&index.to_be_bytes());
            }
            ok_with(payload)
        }
        ins::LOAD_KEY => {
            if !card.pin_verified {
                return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
            }
            if command.p1() != 0x03 || command.data().len() != 64 {
                return sw_only(status::SW_WRONG_DATA);
            }
            let seed: [u8; 64] = command.data().try_into().unwrap();
            card.load_seed(&seed);
            ok_with(card.key_uid.clone())
        }
        ins::GENERATE_KEY => {
            if !card.pin_verified {
                return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
            }
            let mut master = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut master);
            card.set_master(master);
            ok_with(card.key_uid.clone())
        }
        ins::REMOVE_KEY => {
            if !card.pin_verified {
                return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
            }
            card.master_secret = None;
            card.key_uid.clear();
            ok_with(Vec::new())
        }
        ins::EXPORT_KEY => {
            if !card.pin_verified {
                return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
            }
            let master = match card.master_secret {
                Some(master) => master,
                None => return sw_only(status::SW_REFERENCED_DATA_NOT_FOUND),
            };
            let key = derived_key(&master, command.data());
            let public = key.public_key().to_encoded_point(false);

            let mut content = Vec::new();
            content.extend_from_slice(&encode_tlv(tags::ECC_PUBLIC_KEY, public.as_bytes()));
            match command.p2() {
                0x00 => content.extend_from_slice(&encode_tlv(
                    tags::ECC_PRIVATE_KEY,
                    &key.to_bytes(),
                )),
                0x01 => {}
                0x02 => content.extend_from_slice(&encode_tlv(
                    tags::CHAIN_CODE,
                    &derived_chain_code(&master, command.data()),
                )),
                _ => return sw_only(status::SW_INCORRECT_P1P2),
            }
            ok_with(encode_tlv(tags::TEMPLATE_KEYPAIR, &content))
        }
        ins::SIGN => {
            if !card.pin_verified {
                return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
            }
            let master = match card.master_secret {
                Some(master) => master,
                None => return sw_only(status::SW_REFERENCED_DATA_NOT_FOUND),
            };
            let data = command.data();
            if data.len() < 32 {
                return sw_only(status::SW_WRONG_DATA);
            }
            let (hash, path_bytes) = data.split_at(32);
            let key = derived_key(&master, path_bytes);
            let signing = SigningKey::from(&key);
            let signature: Signature = match signing.sign_prehash(hash) {
                Ok(signature) => signature,
                Err(_) => return sw_only(status::SW_INTERNAL_ERROR),
            };

            let public = key.public_key().to_encoded_point(false);
            let mut content = Vec::new();
            content.extend_from_slice(&encode_tlv(tags::ECC_PUBLIC_KEY, public.as_bytes()));
            content.extend_from_slice(signature.to_der().as_bytes());
            ok_with(encode_tlv(tags::TEMPLATE_SIGNATURE, &content))
        }
        ins::GET_DATA => {
            ok_with(card.data_slots.get(&command.p1()).cloned().unwrap_or_default())
        }
        ins::STORE_DATA => {
            if !card.pin_verified {
                return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
            }
            card.data_slots
                .insert(command.p1(), command.data().to_vec());
            ok_with(Vec::new())
        }
        ins::UNPAIR => {
            if !card.pin_verified {
                return sw_only(status::SW_CONDITIONS_NOT_SATISFIED);
            }
            card.pairings.remove(&command.p1());
            ok_with(Vec::new())
        }
        _ => sw_only(status::SW_INS_NOT_SUPPORTED),
    }
}
