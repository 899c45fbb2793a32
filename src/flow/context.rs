//! Shared flow machinery: parameters, card snapshot, pause/resume and the
//! common prelude every flow goes through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::params::{errors, keys, signals};
use super::state::FlowStateMachine;
use crate::channel::Channel;
use crate::command_set::CommandSet;
use crate::constants::DEFAULT_PAIRING_PASSWORD;
use crate::flow::FlowState;
use crate::signal::SignalBus;
use crate::storage::PairingStore;
use crate::types::{ApplicationInfo, Version};
use crate::Error;

/// How a flow unwound early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowAbort {
    /// Cancelled by the engine; no result signal is emitted.
    Cancelled,
    /// Failed with a stable error tag carried in the flow result.
    Fail(&'static str),
}

pub(crate) type StepResult = Result<(), FlowAbort>;
pub(crate) type FlowOutput = Result<Map<String, Value>, FlowAbort>;

// Optimistic wait before bothering the user with an insert-card prompt;
// suppresses a spurious blink when the card arrives together with the
// flow start.
const CARD_GRACE: Duration = Duration::from_millis(150);

/// Card facts accumulated by the running flow, cleared on restart.
#[derive(Clone)]
pub(crate) struct CardSnapshot {
    pub instance_uid: String,
    pub key_uid: String,
    pub free_slots: i32,
    pub pin_retries: i32,
    pub puk_retries: i32,
    pub initialized: bool,
    pub version: Option<Version>,
}

impl Default for CardSnapshot {
    fn default() -> Self {
        Self {
            instance_uid: String::new(),
            key_uid: String::new(),
            free_slots: -1,
            pin_retries: -1,
            puk_retries: -1,
            initialized: false,
            version: None,
        }
    }
}

impl CardSnapshot {
    fn update_from(&mut self, info: &ApplicationInfo) {
        self.instance_uid = info.instance_uid_hex();
        self.key_uid = info.key_uid_hex();
        self.free_slots = info.available_slots as i32;
        self.initialized = info.initialized;
        self.version = Some(info.version);
    }

    fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if !self.instance_uid.is_empty() {
            map.insert(keys::INSTANCE_UID.into(), json!(self.instance_uid));
        }
        if !self.key_uid.is_empty() {
            map.insert(keys::KEY_UID.into(), json!(self.key_uid));
        }
        if self.free_slots >= 0 {
            map.insert(keys::FREE_SLOTS.into(), json!(self.free_slots));
        }
        if self.pin_retries >= 0 {
            map.insert(keys::PIN_RETRIES.into(), json!(self.pin_retries));
            map.insert(keys::PUK_RETRIES.into(), json!(self.puk_retries));
        }
        map
    }
}

#[derive(Default)]
struct PauseState {
    paused: bool,
    cancelled: bool,
    should_restart: bool,
}

/// Everything a flow body needs: the engine resources it borrows plus the
/// pause/resume synchronization.
pub(crate) struct FlowContext {
    machine: Arc<FlowStateMachine>,
    signals: Arc<SignalBus>,
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) command_set: Arc<Mutex<CommandSet>>,
    storage: Arc<Mutex<PairingStore>>,
    params: Mutex<Map<String, Value>>,
    card: Mutex<CardSnapshot>,
    pause: Mutex<PauseState>,
    resume_cond: Condvar,
    waiting_for_card: AtomicBool,
}

impl FlowContext {
    pub(crate) fn new(
        machine: Arc<FlowStateMachine>,
        signals: Arc<SignalBus>,
        channel: Arc<dyn Channel>,
        command_set: Arc<Mutex<CommandSet>>,
        storage: Arc<Mutex<PairingStore>>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            machine,
            signals,
            channel,
            command_set,
            storage,
            params: Mutex::new(params),
            card: Mutex::new(CardSnapshot::default()),
            pause: Mutex::new(PauseState::default()),
            resume_cond: Condvar::new(),
            waiting_for_card: AtomicBool::new(false),
        }
    }

    //
    // Parameters
    //

    /// Non-empty string parameter, if present.
    pub(crate) fn param_str(&self, key: &str) -> Option<String> {
        self.params
            .lock()
            .unwrap()
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub(crate) fn param_bool(&self, key: &str) -> bool {
        self.params
            .lock()
            .unwrap()
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub(crate) fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.lock().unwrap().get(key).and_then(Value::as_u64)
    }

    pub(crate) fn param(&self, key: &str) -> Option<Value> {
        self.params.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn set_param(&self, key: &str, value: Value) {
        self.params.lock().unwrap().insert(key.to_string(), value);
    }

    //
    // Pause / resume / cancel
    //

    /// Merge new parameters and wake the paused worker.
    pub(crate) fn resume(&self, new_params: Map<String, Value>) {
        {
            let mut params = self.params.lock().unwrap();
            for (key, value) in new_params {
                params.insert(key, value);
            }
        }
        let mut pause = self.pause.lock().unwrap();
        pause.paused = false;
        self.resume_cond.notify_all();
    }

    /// Flag cancellation and wake the worker. The worker observes the
    /// flag at its next pause or card-wait check; an in-flight APDU is
    /// never interrupted.
    pub(crate) fn cancel(&self) {
        let mut pause = self.pause.lock().unwrap();
        pause.cancelled = true;
        self.resume_cond.notify_all();
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.pause.lock().unwrap().cancelled
    }

    pub(crate) fn should_restart(&self) -> bool {
        self.pause.lock().unwrap().should_restart
    }

    pub(crate) fn clear_restart(&self) {
        self.pause.lock().unwrap().should_restart = false;
    }

    pub(crate) fn reset_card(&self) {
        *self.card.lock().unwrap() = CardSnapshot::default();
    }

    pub(crate) fn is_waiting_for_card(&self) -> bool {
        self.waiting_for_card.load(Ordering::SeqCst)
    }

    /// Emit a pause event and block until resume or cancellation.
    pub(crate) fn pause_and_wait(&self, action: &str, error_tag: &'static str) -> StepResult {
        self.pause_and_wait_with_status(action, error_tag, Map::new())
    }

    /// Pause with extra status fields merged into the event payload.
    pub(crate) fn pause_and_wait_with_status(
        &self,
        action: &str,
        error_tag: &'static str,
        status: Map<String, Value>,
    ) -> StepResult {
        let mut event = status;
        event.insert(keys::ERROR.into(), json!(error_tag));
        for (key, value) in self.card_map() {
            event.entry(key).or_insert(value);
        }

        {
            let mut pause = self.pause.lock().unwrap();
            if pause.cancelled {
                return Err(FlowAbort::Cancelled);
            }
            pause.paused = true;
        }
        self.machine.transition(FlowState::Paused);
        debug!(action, error = error_tag, "flow paused");
        self.signals.emit(action, Value::Object(event));

        let mut pause = self.pause.lock().unwrap();
        while pause.paused && !pause.cancelled {
            pause = self.resume_cond.wait(pause).unwrap();
        }
        if pause.cancelled {
            return Err(FlowAbort::Cancelled);
        }
        Ok(())
    }

    /// Pause, and have the engine re-run the flow from the top once the
    /// user resumes. Models "please swap the card" without unwinding the
    /// engine.
    pub(crate) fn pause_and_restart(&self, action: &str, error_tag: &'static str) -> FlowAbort {
        self.pause.lock().unwrap().should_restart = true;
        match self.pause_and_wait(action, error_tag) {
            Err(abort) => abort,
            Ok(()) => FlowAbort::Fail(error_tag),
        }
    }

    //
    // Common prelude
    //

    /// Wait until a card is reachable, pausing with `insert-card` after a
    /// short optimistic grace period.
    pub(crate) fn wait_for_card(&self) -> StepResult {
        if self.cancelled() {
            return Err(FlowAbort::Cancelled);
        }
        if self.channel.is_connected() {
            return Ok(());
        }

        std::thread::sleep(CARD_GRACE);
        if self.cancelled() {
            return Err(FlowAbort::Cancelled);
        }
        if self.channel.is_connected() {
            return Ok(());
        }

        loop {
            self.waiting_for_card.store(true, Ordering::SeqCst);
            let waited = self.pause_and_wait(signals::INSERT_CARD, errors::CONNECTION_ERROR);
            self.waiting_for_card.store(false, Ordering::SeqCst);
            waited?;

            if self.channel.is_connected() {
                // Only announced when the flow actually had to wait.
                self.signals
                    .emit(signals::CARD_INSERTED, Value::Object(self.card_map()));
                return Ok(());
            }
        }
    }

    /// SELECT the applet and refresh the flow's card snapshot.
    pub(crate) fn select_keycard(&self) -> StepResult {
        if !self.channel.is_connected() {
            self.wait_for_card()?;
        }

        match self.command_set.lock().unwrap().select() {
            Ok(info) => {
                self.card.lock().unwrap().update_from(&info);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "applet selection failed");
                Err(FlowAbort::Fail(errors::SELECT_FAILED))
            }
        }
    }

    /// Look up or establish a pairing, open the secure channel, and
    /// optionally verify the PIN.
    pub(crate) fn authenticate(&self, with_pin: bool) -> StepResult {
        let (uid, initialized) = {
            let card = self.card.lock().unwrap();
            (card.instance_uid.clone(), card.initialized)
        };
        if !initialized {
            warn!("cannot authenticate an uninitialized card");
            return Err(FlowAbort::Fail(errors::AUTH_FAILED));
        }

        let pairing = self.storage.lock().unwrap().get(&uid);
        let pairing = match pairing {
            Some(pairing) => pairing,
            None => {
                debug!("no saved pairing; trying default password");
                let attempt = self
                    .command_set
                    .lock()
                    .unwrap()
                    .pair(DEFAULT_PAIRING_PASSWORD);
                let pairing = match attempt {
                    Ok(pairing) => pairing,
                    Err(Error::NoAvailablePairingSlots) => {
                        warn!("card has no free pairing slots");
                        return Err(FlowAbort::Fail(errors::AUTH_FAILED));
                    }
                    Err(_) => {
                        self.pause_and_wait(signals::ENTER_PAIRING, errors::ENTER_PAIRING)?;
                        let password = self
                            .param_str(keys::PAIRING_PASS)
                            .ok_or(FlowAbort::Fail(errors::MISSING_CREDENTIALS))?;
                        match self.command_set.lock().unwrap().pair(&password) {
                            Ok(pairing) => pairing,
                            Err(e) => {
                                warn!(error = %e, "pairing failed with user password");
                                return Err(FlowAbort::Fail(errors::AUTH_FAILED));
                            }
                        }
                    }
                };
                if let Err(e) = self.storage.lock().unwrap().put(&uid, pairing.clone()) {
                    warn!(error = %e, "failed to persist pairing; it will be lost on restart");
                }
                pairing
            }
        };

        if let Err(e) = self
            .command_set
            .lock()
            .unwrap()
            .open_secure_channel(&pairing)
        {
            warn!(error = %e, "failed to open secure channel");
            return Err(FlowAbort::Fail(errors::AUTH_FAILED));
        }

        if with_pin {
            self.verify_pin()?;
        }
        Ok(())
    }

    /// Verify the PIN from parameters, pausing for entry or re-entry as
    /// needed. At zero remaining attempts the flow fails with
    /// `pin-blocked`.
    pub(crate) fn verify_pin(&self) -> StepResult {
        let mut pin = self.param_str(keys::PIN);
        if pin.is_none() {
            self.pause_and_wait(signals::ENTER_PIN, errors::ENTER_PIN)?;
            pin = self.param_str(keys::PIN);
        }

        loop {
            let Some(current) = pin else {
                return Err(FlowAbort::Fail(errors::MISSING_CREDENTIALS));
            };
            match self.command_set.lock().unwrap().verify_pin(&current) {
                Ok(()) => return Ok(()),
                Err(Error::WrongPin { remaining }) => {
                    {
                        let mut card = self.card.lock().unwrap();
                        card.pin_retries = remaining as i32;
                    }
                    if remaining == 0 {
                        return Err(FlowAbort::Fail(errors::PIN_BLOCKED));
                    }
                    self.pause_and_wait(signals::ENTER_PIN, errors::WRONG_PIN)?;
                    pin = self.param_str(keys::PIN);
                }
                Err(Error::PinBlocked) => {
                    self.card.lock().unwrap().pin_retries = 0;
                    return Err(FlowAbort::Fail(errors::PIN_BLOCKED));
                }
                Err(e) => {
                    warn!(error = %e, "PIN verification failed");
                    return Err(FlowAbort::Fail(errors::AUTH_FAILED));
                }
            }
        }
    }

    /// Fail with a card-swap prompt unless the card has keys.
    pub(crate) fn require_keys(&self) -> StepResult {
        if !self.card.lock().unwrap().key_uid.is_empty() {
            return Ok(());
        }
        warn!("card has no keys");
        Err(self.pause_and_restart(signals::SWAP_CARD, errors::NO_KEYS))
    }

    /// Fail with a card-swap prompt if the card already has keys, unless
    /// the caller allowed overwriting.
    pub(crate) fn require_no_keys(&self) -> StepResult {
        if self.card.lock().unwrap().key_uid.is_empty() {
            return Ok(());
        }
        if self.param_bool(keys::OVERWRITE) {
            debug!("card has keys but overwrite is allowed");
            return Ok(());
        }
        warn!("card already has keys");
        Err(self.pause_and_restart(signals::SWAP_CARD, errors::HAS_KEYS))
    }

    //
    // Card snapshot
    //

    pub(crate) fn card_map(&self) -> Map<String, Value> {
        self.card.lock().unwrap().to_map()
    }

    pub(crate) fn card(&self) -> CardSnapshot {
        self.card.lock().unwrap().clone()
    }

    pub(crate) fn update_card_retries(&self, pin: i32, puk: i32) {
        let mut card = self.card.lock().unwrap();
        card.pin_retries = pin;
        card.puk_retries = puk;
    }
}
