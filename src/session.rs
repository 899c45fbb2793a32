//! Single-card session lifecycle and state machine.
//!
//! The session manager owns one channel, at most one command set and the
//! pairing store, and exposes the flat procedural API used by non-flow
//! workflows. Card-touching operations serialize on a single operation
//! mutex; the connect sequence runs on a background thread so channel
//! event delivery is never blocked on card round-trips.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use coins_bip32::path::DerivationPath;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelEvent, ChannelState};
use crate::command_set::{CommandSet, ExportOption};
use crate::constants::{paths, SLOT_PUBLIC_DATA};
use crate::crypto::bip39_seed;
use crate::metadata::Metadata;
use crate::signal::SignalBus;
use crate::storage::PairingStore;
use crate::types::{ApplicationInfo, ApplicationStatus, Keypair, Secrets};
use crate::{Error, Result};

/// Signal type emitted on every session state transition.
pub const SIGNAL_STATUS_CHANGED: &str = "status-changed";

const EVENT_POLL: Duration = Duration::from_millis(100);

/// Session state machine. External representation is kebab-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    UnknownReaderState,
    NoReadersFound,
    WaitingForReader,
    ReaderConnectionError,
    WaitingForCard,
    ConnectingCard,
    EmptyKeycard,
    NotKeycard,
    ConnectionError,
    PairingError,
    BlockedPin,
    BlockedPuk,
    Ready,
    Authorized,
    FactoryResetting,
}

impl SessionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownReaderState => "unknown-reader-state",
            Self::NoReadersFound => "no-readers-found",
            Self::WaitingForReader => "waiting-for-reader",
            Self::ReaderConnectionError => "reader-connection-error",
            Self::WaitingForCard => "waiting-for-card",
            Self::ConnectingCard => "connecting-card",
            Self::EmptyKeycard => "empty-keycard",
            Self::NotKeycard => "not-keycard",
            Self::ConnectionError => "connection-error",
            Self::PairingError => "pairing-error",
            Self::BlockedPin => "blocked-pin",
            Self::BlockedPuk => "blocked-puk",
            Self::Ready => "ready",
            Self::Authorized => "authorized",
            Self::FactoryResetting => "factory-resetting",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured snapshot returned by [`SessionManager::get_status`] and
/// carried in the `status-changed` signal payload. Built entirely from
/// cached card data; never triggers an APDU.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: String,
    #[serde(rename = "keycardInfo", skip_serializing_if = "Option::is_none")]
    pub keycard_info: Option<KeycardInfo>,
    #[serde(rename = "keycardStatus", skip_serializing_if = "Option::is_none")]
    pub keycard_status: Option<KeycardStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeycardInfo {
    pub installed: bool,
    pub initialized: bool,
    #[serde(rename = "instanceUID")]
    pub instance_uid: String,
    pub version: String,
    #[serde(rename = "availableSlots")]
    pub available_slots: u8,
    #[serde(rename = "keyUID")]
    pub key_uid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeycardStatus {
    #[serde(rename = "remainingAttemptsPIN")]
    pub remaining_attempts_pin: i8,
    #[serde(rename = "remainingAttemptsPUK")]
    pub remaining_attempts_puk: i8,
    #[serde(rename = "keyInitialized")]
    pub key_initialized: bool,
    pub path: String,
}

/// Keys exported by the login procedure.
#[derive(Debug, Clone)]
pub struct LoginKeys {
    pub whisper: Keypair,
    pub encryption: Keypair,
}

/// Keys exported by the account recovery procedure.
#[derive(Debug, Clone)]
pub struct RecoverKeys {
    pub login: LoginKeys,
    pub eip1581: Keypair,
    pub wallet_root: Keypair,
    pub wallet: Keypair,
    pub master: Keypair,
}

struct Shared {
    state: SessionState,
    channel: Option<Arc<dyn Channel>>,
    store: Option<PairingStore>,
    app_info: Option<ApplicationInfo>,
    app_status: Option<ApplicationStatus>,
    metadata: Option<Metadata>,
    current_uid: String,
    authorized: bool,
    last_error: String,
    started: bool,
    event_thread: Option<JoinHandle<()>>,
}

struct SessionInner {
    signals: Arc<SignalBus>,
    // Serializes every card-touching operation, including teardown.
    ops: Mutex<()>,
    command_set: Mutex<Option<CommandSet>>,
    shared: Mutex<Shared>,
    stop: AtomicBool,
}

/// Long-lived per-command facade over one card at a time.
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(signals: Arc<SignalBus>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                signals,
                ops: Mutex::new(()),
                command_set: Mutex::new(None),
                shared: Mutex::new(Shared {
                    state: SessionState::UnknownReaderState,
                    channel: None,
                    store: None,
                    app_info: None,
                    app_status: None,
                    metadata: None,
                    current_uid: String::new(),
                    authorized: false,
                    last_error: String::new(),
                    started: false,
                    event_thread: None,
                }),
                stop: AtomicBool::new(false),
            }),
        }
    }

    /// Start the session over the given channel.
    ///
    /// Idempotent-rejecting: a second call without an intervening
    /// [`stop`](Self::stop) fails with `AlreadyStarted`. The channel must
    /// already live on the platform's UI dispatcher where the backend
    /// requires it (NFC); this function only wires events and arms
    /// detection.
    pub fn start(&self, storage_path: impl Into<PathBuf>, channel: Arc<dyn Channel>) -> Result<()> {
        let events = {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.started {
                shared.last_error = "service already started".into();
                return Err(Error::AlreadyStarted);
            }
            shared.store = Some(PairingStore::new(storage_path));
            shared.channel = Some(channel.clone());
            shared.started = true;
            channel.subscribe()
        };

        self.inner.stop.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || {
            while !inner.stop.load(Ordering::SeqCst) {
                match events.recv_timeout(EVENT_POLL) {
                    Ok(event) => inner.handle_event(event),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        self.inner.shared.lock().unwrap().event_thread = Some(handle);

        channel.start_detection()?;
        debug!("session manager started");
        Ok(())
    }

    /// Stop the session, tearing down the channel and command set. Waits
    /// for any in-flight card operation to finish first.
    pub fn stop(&self) {
        {
            let shared = self.inner.shared.lock().unwrap();
            if !shared.started {
                return;
            }
        }
        self.inner.stop.store(true, Ordering::SeqCst);

        // Acquire the operation mutex so no background task is mid-APDU
        // while the command set is dropped.
        let _op = self.inner.ops.lock().unwrap();
        let (channel, thread) = {
            let mut cs = self.inner.command_set.lock().unwrap();
            *cs = None;
            let mut shared = self.inner.shared.lock().unwrap();
            shared.started = false;
            shared.authorized = false;
            shared.current_uid.clear();
            shared.app_info = None;
            shared.app_status = None;
            shared.metadata = None;
            shared.store = None;
            (shared.channel.take(), shared.event_thread.take())
        };
        if let Some(channel) = channel {
            channel.stop_detection();
            channel.disconnect();
        }
        drop(_op);

        if let Some(thread) = thread {
            let _ = thread.join();
        }
        self.inner.set_state(SessionState::UnknownReaderState);
        debug!("session manager stopped");
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.inner.shared.lock().unwrap().state
    }

    /// Last error surfaced by a session operation.
    pub fn last_error(&self) -> String {
        self.inner.shared.lock().unwrap().last_error.clone()
    }

    /// Structured status snapshot from cached data; never issues an APDU.
    pub fn get_status(&self) -> StatusSnapshot {
        self.inner.snapshot()
    }

    /// Verify the PIN and move to `Authorized`. Requires `Ready`.
    pub fn authorize(&self, pin: &str) -> Result<()> {
        let _op = self.inner.ops.lock().unwrap();
        self.inner.require_state(&[SessionState::Ready])?;

        let mut cs_slot = self.inner.command_set.lock().unwrap();
        let cs = cs_slot.as_mut().ok_or_else(|| self.inner.no_command_set())?;

        match cs.verify_pin(pin) {
            Ok(()) => {
                if let Ok(status) = cs.get_status() {
                    self.inner.shared.lock().unwrap().app_status = Some(status);
                }
                drop(cs_slot);
                self.inner.shared.lock().unwrap().authorized = true;
                self.inner.set_state(SessionState::Authorized);
                Ok(())
            }
            Err(Error::WrongPin { remaining }) => {
                let mut shared = self.inner.shared.lock().unwrap();
                shared.last_error = format!("wrong PIN ({remaining} attempts remaining)");
                if let Some(status) = shared.app_status.as_mut() {
                    status.pin_retry_count = remaining as i8;
                }
                Err(Error::WrongPin { remaining })
            }
            Err(Error::PinBlocked) => {
                self.inner.record_error("PIN is blocked");
                drop(cs_slot);
                self.inner.set_state(SessionState::BlockedPin);
                Err(Error::PinBlocked)
            }
            Err(e) => {
                self.inner.record_error(&e.to_string());
                Err(e)
            }
        }
    }

    /// INIT a pre-initialized (or freshly reset) card, then tear down and
    /// force re-detection so the connect sequence runs with the new
    /// credentials.
    pub fn initialize(&self, pin: &str, puk: &str, pairing_password: &str) -> Result<()> {
        let _op = self.inner.ops.lock().unwrap();
        self.inner
            .require_state(&[SessionState::Ready, SessionState::EmptyKeycard])?;

        let secrets = Secrets::new(pin, puk, pairing_password)?;
        {
            let mut cs_slot = self.inner.command_set.lock().unwrap();
            let cs = cs_slot.as_mut().ok_or_else(|| self.inner.no_command_set())?;
            cs.init(&secrets).map_err(|e| {
                self.inner.record_error(&e.to_string());
                e
            })?;
        }

        debug!("card initialized; resetting connection for re-detection");
        self.inner.teardown_and_rescan();
        Ok(())
    }

    /// Factory-reset the card, then tear down and force re-detection.
    pub fn factory_reset(&self) -> Result<()> {
        let _op = self.inner.ops.lock().unwrap();
        let previous = self
            .inner
            .require_state(&[SessionState::Ready, SessionState::Authorized])?;
        self.inner.set_state(SessionState::FactoryResetting);

        let result = {
            let mut cs_slot = self.inner.command_set.lock().unwrap();
            match cs_slot.as_mut() {
                Some(cs) => cs.factory_reset(),
                None => Err(self.inner.no_command_set()),
            }
        };
        if let Err(e) = result {
            self.inner.record_error(&e.to_string());
            self.inner.set_state(previous);
            return Err(e);
        }

        debug!("factory reset complete; resetting connection for re-detection");
        self.inner.teardown_and_rescan();
        Ok(())
    }

    /// Change the PIN. Requires `Authorized`.
    pub fn change_pin(&self, new_pin: &str) -> Result<()> {
        self.inner
            .with_authorized_command_set(|cs| cs.change_pin(new_pin))
    }

    /// Change the PUK. Requires `Authorized`.
    pub fn change_puk(&self, new_puk: &str) -> Result<()> {
        self.inner
            .with_authorized_command_set(|cs| cs.change_puk(new_puk))
    }

    /// Change the pairing secret. Requires `Authorized`.
    pub fn change_pairing_secret(&self, new_password: &str) -> Result<()> {
        self.inner
            .with_authorized_command_set(|cs| cs.change_pairing_secret(new_password))
    }

    /// Unblock a blocked PIN with the PUK.
    pub fn unblock_pin(&self, puk: &str, new_pin: &str) -> Result<()> {
        let _op = self.inner.ops.lock().unwrap();
        self.inner.require_state(&[
            SessionState::Ready,
            SessionState::Authorized,
            SessionState::BlockedPin,
        ])?;

        let mut cs_slot = self.inner.command_set.lock().unwrap();
        let cs = cs_slot.as_mut().ok_or_else(|| self.inner.no_command_set())?;
        match cs.unblock_pin(puk, new_pin) {
            Ok(()) => Ok(()),
            Err(Error::PukBlocked) => {
                self.inner.record_error("PUK is blocked");
                drop(cs_slot);
                self.inner.set_state(SessionState::BlockedPuk);
                Err(Error::PukBlocked)
            }
            Err(e) => {
                self.inner.record_error(&e.to_string());
                Err(e)
            }
        }
    }

    /// Generate a mnemonic of the given word count (12/15/18/21/24),
    /// returning indices into the BIP39 wordlist.
    pub fn generate_mnemonic(&self, length: usize) -> Result<Vec<u16>> {
        let checksum = match length {
            12 => 4,
            15 => 5,
            18 => 6,
            21 => 7,
            24 => 8,
            _ => return Err(Error::InvalidData("mnemonic length must be 12..24 by 3")),
        };
        self.inner
            .with_authorized_command_set(|cs| cs.generate_mnemonic(checksum))
    }

    /// Derive the BIP39 seed from a mnemonic and load it onto the card.
    /// Returns the new key UID, 0x-prefixed hex.
    pub fn load_mnemonic(&self, mnemonic: &str, passphrase: &str) -> Result<String> {
        let seed = bip39_seed(mnemonic, passphrase);
        let key_uid = self
            .inner
            .with_authorized_command_set(|cs| cs.load_seed(&seed))?;
        Ok(format!("0x{}", hex::encode(key_uid)))
    }

    /// Export the whisper and encryption keys used for login.
    pub fn export_login_keys(&self) -> Result<LoginKeys> {
        self.inner.with_authorized_command_set(export_login)
    }

    /// Export the full recovery key set.
    pub fn export_recover_keys(&self) -> Result<RecoverKeys> {
        let supports_extended = {
            let shared = self.inner.shared.lock().unwrap();
            shared
                .app_info
                .as_ref()
                .map(|info| info.version.supports_extended_keys())
                .unwrap_or(false)
        };
        self.inner.with_authorized_command_set(move |cs| {
            // The first export after channel open seeds the card's
            // current-key pointer; every later one must not move it.
            let encryption = cs.export_key(
                true,
                &parse_path(paths::ENCRYPTION)?,
                ExportOption::PrivateAndPublic,
            )?;
            let whisper = cs.export_key(
                false,
                &parse_path(paths::WHISPER)?,
                ExportOption::PrivateAndPublic,
            )?;
            let eip1581 =
                cs.export_key(false, &parse_path(paths::EIP1581)?, ExportOption::PublicOnly)?;
            let wallet_root_path = parse_path(paths::WALLET_ROOT)?;
            let wallet_root = if supports_extended {
                cs.export_key_extended(false, &wallet_root_path)?
            } else {
                cs.export_key(false, &wallet_root_path, ExportOption::PublicOnly)?
            };
            let wallet =
                cs.export_key(false, &parse_path(paths::WALLET)?, ExportOption::PublicOnly)?;
            let master =
                cs.export_key(false, &parse_path(paths::MASTER)?, ExportOption::PublicOnly)?;

            Ok(RecoverKeys {
                login: LoginKeys {
                    whisper,
                    encryption,
                },
                eip1581,
                wallet_root,
                wallet,
                master,
            })
        })
    }

    /// Fetch and decode the on-card metadata. Requires a connected card.
    pub fn get_metadata(&self) -> Result<Metadata> {
        let _op = self.inner.ops.lock().unwrap();
        self.inner
            .require_state(&[SessionState::Ready, SessionState::Authorized])?;

        let mut cs_slot = self.inner.command_set.lock().unwrap();
        let cs = cs_slot.as_mut().ok_or_else(|| self.inner.no_command_set())?;
        let blob = cs.get_data(SLOT_PUBLIC_DATA)?;
        let metadata = if blob.is_empty() {
            Metadata::default()
        } else {
            Metadata::decode(&blob)?
        };
        drop(cs_slot);
        self.inner.shared.lock().unwrap().metadata = Some(metadata.clone());
        Ok(metadata)
    }

    /// Encode and store metadata on the card. Requires `Authorized`.
    pub fn store_metadata(&self, name: &str, wallet_paths: &[String]) -> Result<()> {
        let metadata = Metadata::from_paths(name, wallet_paths)?;
        let blob = metadata.encode()?;
        self.inner
            .with_authorized_command_set(move |cs| cs.store_data(SLOT_PUBLIC_DATA, &blob))?;
        self.inner.shared.lock().unwrap().metadata = Some(metadata);
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn export_login(cs: &mut CommandSet) -> Result<LoginKeys> {
    // make_current=true on the first export seeds the card's current-key
    // pointer, unset right after channel open.
    let whisper = cs.export_key(
        true,
        &parse_path(paths::WHISPER)?,
        ExportOption::PrivateAndPublic,
    )?;
    let encryption = cs.export_key(
        false,
        &parse_path(paths::ENCRYPTION)?,
        ExportOption::PrivateAndPublic,
    )?;
    Ok(LoginKeys {
        whisper,
        encryption,
    })
}

fn parse_path(path: &str) -> Result<DerivationPath> {
    Ok(path.parse()?)
}

impl SessionInner {
    fn handle_event(self: &Arc<Self>, event: ChannelEvent) {
        match event {
            ChannelEvent::ReaderAvailabilityChanged(available) => {
                self.on_reader_availability(available)
            }
            ChannelEvent::TargetDetected { uid } => self.on_target_detected(uid),
            ChannelEvent::TargetLost => self.on_target_lost(),
            ChannelEvent::Error { kind, message } => {
                warn!(?kind, %message, "channel error");
                self.record_error(&message);
            }
        }
    }

    fn on_reader_availability(&self, available: bool) {
        debug!(available, "reader availability changed");
        let state = self.shared.lock().unwrap().state;
        if available {
            if matches!(
                state,
                SessionState::UnknownReaderState | SessionState::WaitingForReader
            ) {
                // Clear any lingering command set before waiting for a tap.
                *self.command_set.lock().unwrap() = None;
                let channel = self.shared.lock().unwrap().channel.clone();
                self.set_state(SessionState::WaitingForCard);
                if let Some(channel) = channel {
                    // The single point where the NFC drawer may auto-open.
                    channel.set_state(ChannelState::WaitingForCard);
                }
            }
        } else {
            *self.command_set.lock().unwrap() = None;
            if matches!(
                state,
                SessionState::UnknownReaderState | SessionState::WaitingForCard
            ) {
                self.set_state(SessionState::WaitingForReader);
            }
        }
    }

    fn on_target_detected(self: &Arc<Self>, uid: String) {
        {
            let mut shared = self.shared.lock().unwrap();
            let same_card = shared.current_uid == uid;
            if same_card
                && matches!(
                    shared.state,
                    SessionState::Ready | SessionState::Authorized | SessionState::ConnectingCard
                )
            {
                debug!(%uid, "ignoring re-tap of connected card");
                return;
            }
            shared.current_uid = uid.clone();
        }
        debug!(%uid, "card detected");
        self.set_state(SessionState::ConnectingCard);

        // Connecting blocks on card round-trips; never do it on the event
        // thread.
        let inner = Arc::clone(self);
        std::thread::spawn(move || inner.connect_card());
    }

    fn on_target_lost(&self) {
        debug!("card removed");
        *self.command_set.lock().unwrap() = None;
        let started = {
            let mut shared = self.shared.lock().unwrap();
            shared.current_uid.clear();
            shared.authorized = false;
            shared.app_status = None;
            shared.metadata = None;
            shared.started
        };
        if started {
            self.set_state(SessionState::WaitingForCard);
        }
    }

    /// The connect sequence: fresh command set, SELECT, pair if needed,
    /// open the secure channel, mandatory GET STATUS, best-effort
    /// metadata, then `Ready`.
    fn connect_card(&self) {
        let _op = self.ops.lock().unwrap();
        if self.stop.load(Ordering::SeqCst) {
            return;
        }

        let channel = match self.shared.lock().unwrap().channel.clone() {
            Some(channel) => channel,
            None => return,
        };

        // A fresh command set per insertion; reusing one carries stale
        // secure-channel state that corrupts later commands.
        let mut cs = CommandSet::new(channel.clone());

        let info = match cs.select() {
            Ok(info) => info,
            Err(Error::NotKeycard) => {
                self.record_error("selected applet is not a Keycard");
                self.set_state(SessionState::NotKeycard);
                return;
            }
            Err(e) => {
                self.record_error(&e.to_string());
                self.set_state(SessionState::ConnectionError);
                return;
            }
        };
        self.shared.lock().unwrap().app_info = Some(info.clone());

        if !info.initialized {
            debug!("card is pre-initialized; awaiting INIT");
            *self.command_set.lock().unwrap() = Some(cs);
            self.set_state(SessionState::EmptyKeycard);
            return;
        }

        let uid_hex = info.instance_uid_hex();
        let pairing = {
            let mut shared = self.shared.lock().unwrap();
            shared.store.as_mut().and_then(|store| store.get(&uid_hex))
        };
        let pairing = match pairing {
            Some(pairing) => pairing,
            None => {
                debug!("no saved pairing; pairing with default password");
                match cs.pair(crate::constants::DEFAULT_PAIRING_PASSWORD) {
                    Ok(pairing) => {
                        let mut shared = self.shared.lock().unwrap();
                        if let Some(store) = shared.store.as_mut() {
                            if let Err(e) = store.put(&uid_hex, pairing.clone()) {
                                warn!(error = %e, "failed to persist pairing");
                            }
                        }
                        pairing
                    }
                    Err(Error::NoAvailablePairingSlots) => {
                        self.record_error("no available pairing slots");
                        self.set_state(SessionState::PairingError);
                        return;
                    }
                    Err(Error::WrongPairingPassword) => {
                        self.record_error("wrong pairing password");
                        self.set_state(SessionState::PairingError);
                        return;
                    }
                    Err(e) => {
                        self.record_error(&e.to_string());
                        self.set_state(SessionState::ConnectionError);
                        return;
                    }
                }
            }
        };

        if let Err(e) = cs.open_secure_channel(&pairing) {
            self.record_error(&e.to_string());
            self.set_state(SessionState::ConnectionError);
            return;
        }

        // Mandatory after channel open: without it the applet state
        // machine is mis-initialized and later VERIFY PIN fails with
        // opaque status words.
        match cs.get_status() {
            Ok(status) => {
                self.shared.lock().unwrap().app_status = Some(status);
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch application status after channel open");
            }
        }

        // Best-effort metadata; failures do not mark the session errored.
        match cs.get_data(SLOT_PUBLIC_DATA) {
            Ok(blob) if !blob.is_empty() => match Metadata::decode(&blob) {
                Ok(metadata) => {
                    self.shared.lock().unwrap().metadata = Some(metadata);
                }
                Err(e) => warn!(error = %e, "failed to decode on-card metadata"),
            },
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to fetch metadata"),
        }

        *self.command_set.lock().unwrap() = Some(cs);
        self.set_state(SessionState::Ready);
        // Let the NFC drawer close while the user reads the card info.
        channel.set_state(ChannelState::Idle);
    }

    /// Drop the command set, clear card affinity and force re-detection.
    /// Used after INIT and factory reset, both of which structurally
    /// invalidate the connection.
    fn teardown_and_rescan(&self) {
        *self.command_set.lock().unwrap() = None;
        let channel = {
            let mut shared = self.shared.lock().unwrap();
            shared.current_uid.clear();
            shared.authorized = false;
            shared.app_status = None;
            shared.metadata = None;
            shared.channel.clone()
        };
        if let Some(channel) = channel {
            channel.disconnect();
            channel.force_scan();
        }
    }

    fn with_authorized_command_set<T>(
        &self,
        f: impl FnOnce(&mut CommandSet) -> Result<T>,
    ) -> Result<T> {
        let _op = self.ops.lock().unwrap();
        self.require_state(&[SessionState::Authorized])?;

        let mut cs_slot = self.command_set.lock().unwrap();
        let cs = cs_slot.as_mut().ok_or_else(|| self.no_command_set())?;
        f(cs).map_err(|e| {
            self.record_error(&e.to_string());
            e
        })
    }

    fn require_state(&self, allowed: &[SessionState]) -> Result<SessionState> {
        let mut shared = self.shared.lock().unwrap();
        let state = shared.state;
        if allowed.contains(&state) {
            Ok(state)
        } else {
            let message = format!("operation not allowed in state {state}");
            shared.last_error = message.clone();
            Err(Error::InvalidState(message))
        }
    }

    fn no_command_set(&self) -> Error {
        self.record_error("no command set available (no card connected)");
        Error::InvalidState("no card connected".into())
    }

    fn record_error(&self, message: &str) {
        self.shared.lock().unwrap().last_error = message.to_string();
    }

    fn set_state(&self, new_state: SessionState) {
        let snapshot = {
            let mut shared = self.shared.lock().unwrap();
            if shared.state == new_state {
                return;
            }
            let old = shared.state;
            shared.state = new_state;
            debug!(from = %old, to = %new_state, "session state change");
            snapshot_locked(&shared)
        };
        self.signals
            .emit(SIGNAL_STATUS_CHANGED, json!(snapshot));
    }

    fn snapshot(&self) -> StatusSnapshot {
        snapshot_locked(&self.shared.lock().unwrap())
    }
}

fn snapshot_locked(shared: &MutexGuard<'_, Shared>) -> StatusSnapshot {
    build_snapshot(shared)
}

fn build_snapshot(shared: &Shared) -> StatusSnapshot {
    let keycard_info = shared.app_info.as_ref().map(|info| KeycardInfo {
        installed: info.installed,
        initialized: info.initialized,
        instance_uid: info.instance_uid_hex(),
        version: info.version.to_string(),
        available_slots: info.available_slots,
        key_uid: info.key_uid_hex(),
    });

    let in_card_states = matches!(
        shared.state,
        SessionState::Ready | SessionState::Authorized
    );
    let keycard_status = match (&shared.app_status, in_card_states) {
        (Some(status), true) if status.is_known() => Some(KeycardStatus {
            remaining_attempts_pin: status.pin_retry_count,
            remaining_attempts_puk: status.puk_retry_count,
            key_initialized: status.key_initialized,
            path: String::new(),
        }),
        _ => None,
    };

    StatusSnapshot {
        state: shared.state.as_str().to_string(),
        keycard_info,
        keycard_status,
        metadata: shared.metadata.as_ref().map(Metadata::to_json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_kebab_case() {
        assert_eq!(SessionState::UnknownReaderState.as_str(), "unknown-reader-state");
        assert_eq!(SessionState::EmptyKeycard.as_str(), "empty-keycard");
        assert_eq!(SessionState::BlockedPin.as_str(), "blocked-pin");
        assert_eq!(SessionState::Ready.as_str(), "ready");
    }

    #[test]
    fn snapshot_omits_card_sections_when_unknown() {
        let shared = Shared {
            state: SessionState::WaitingForCard,
            channel: None,
            store: None,
            app_info: None,
            app_status: None,
            metadata: None,
            current_uid: String::new(),
            authorized: false,
            last_error: String::new(),
            started: false,
            event_thread: None,
        };
        let snapshot = build_snapshot(&shared);
        assert_eq!(snapshot.state, "waiting-for-card");
        assert!(snapshot.keycard_info.is_none());
        assert!(snapshot.keycard_status.is_none());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json, json!({"state": "waiting-for-card"}));
    }
}
