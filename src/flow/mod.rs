//! Pausable, user-guided flow engine.
//!
//! One flow runs at a time on a worker thread, borrowing the engine's
//! channel and its persistent command set. Flows pause for user input by
//! blocking on a condition variable; the facade resumes them with merged
//! parameters or cancels them. A flow may request a restart (card swap),
//! in which case the engine clears the flow's card snapshot and re-runs
//! its body from the top.

mod change_credentials;
mod context;
mod export;
mod export_public;
mod get_app_info;
mod load_account;
mod login;
mod metadata_flows;
pub mod params;
mod recover_account;
mod sign;
mod state;

pub use state::{valid_transition, FlowState, FlowType};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use self::change_credentials::Credential;
use self::context::{FlowAbort, FlowContext, FlowOutput};
use self::params::{keys, signals};
use self::state::FlowStateMachine;
use crate::channel::{Channel, ChannelEvent};
use crate::command_set::CommandSet;
use crate::signal::SignalBus;
use crate::storage::PairingStore;
use crate::{Error, Result};

const EVENT_POLL: Duration = Duration::from_millis(100);
// How long the auto-resume path waits for a flow that flagged
// waiting-for-card to actually reach the paused state.
const PAUSE_SETTLE_RETRIES: u32 = 40;
const PAUSE_SETTLE_STEP: Duration = Duration::from_millis(5);

struct Resources {
    channel: Arc<dyn Channel>,
    command_set: Arc<Mutex<CommandSet>>,
    storage: Arc<Mutex<PairingStore>>,
}

struct CurrentFlow {
    flow_type: FlowType,
    ctx: Arc<FlowContext>,
    worker: Option<JoinHandle<()>>,
}

struct EngineInner {
    signals: Arc<SignalBus>,
    machine: Arc<FlowStateMachine>,
    // Serializes the lifecycle API: start, resume, cancel.
    api: Mutex<()>,
    resources: Mutex<Option<Resources>>,
    current: Mutex<Option<CurrentFlow>>,
    current_uid: Mutex<String>,
    last_error: Mutex<String>,
    detection_running: AtomicBool,
    stop_events: AtomicBool,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Facade for multi-step, user-guided card procedures.
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl FlowEngine {
    pub fn new(signals: Arc<SignalBus>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                signals,
                machine: Arc::new(FlowStateMachine::default()),
                api: Mutex::new(()),
                resources: Mutex::new(None),
                current: Mutex::new(None),
                current_uid: Mutex::new(String::new()),
                last_error: Mutex::new(String::new()),
                detection_running: AtomicBool::new(false),
                stop_events: AtomicBool::new(false),
                event_thread: Mutex::new(None),
            }),
        }
    }

    /// Bind the engine to a channel and pairing storage, and start its
    /// persistent command set. Does not arm detection; call
    /// [`start_continuous_detection`](Self::start_continuous_detection).
    pub fn init(&self, storage_path: impl Into<PathBuf>, channel: Arc<dyn Channel>) -> Result<()> {
        let _api = self.inner.api.lock().unwrap();
        let mut resources = self.inner.resources.lock().unwrap();
        if resources.is_some() {
            return Err(Error::AlreadyStarted);
        }

        // One command set for the life of the engine, so card caches and
        // pairing state carry across successive flows.
        *resources = Some(Resources {
            channel: channel.clone(),
            command_set: Arc::new(Mutex::new(CommandSet::new(channel.clone()))),
            storage: Arc::new(Mutex::new(PairingStore::new(storage_path))),
        });
        drop(resources);

        let events = channel.subscribe();
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || {
            while !inner.stop_events.load(Ordering::SeqCst) {
                match events.recv_timeout(EVENT_POLL) {
                    Ok(ChannelEvent::TargetDetected { uid }) => inner.on_target_detected(uid),
                    Ok(ChannelEvent::TargetLost) => {
                        inner.current_uid.lock().unwrap().clear();
                    }
                    Ok(_) => {}
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        if let Some(old) = self.inner.event_thread.lock().unwrap().replace(handle) {
            let _ = old.join();
        }

        debug!("flow engine initialized");
        Ok(())
    }

    /// Arm card detection; kept running across flows.
    pub fn start_continuous_detection(&self) -> Result<()> {
        let channel = self.inner.channel()?;
        if self.inner.detection_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let armed = channel.start_detection();
        if armed.is_err() {
            self.inner.detection_running.store(false, Ordering::SeqCst);
        }
        armed
    }

    /// Stop card detection.
    pub fn stop_continuous_detection(&self) {
        if !self.inner.detection_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(channel) = self.inner.channel() {
            channel.stop_detection();
        }
    }

    /// Start a flow by its stable code. Exactly one flow runs at a time.
    pub fn start_flow(&self, flow_type_code: i32, params: Value) -> Result<()> {
        let _api = self.inner.api.lock().unwrap();

        if self.inner.machine.state() != FlowState::Idle {
            self.inner.set_last_error("flow already running");
            return Err(Error::FlowAlreadyRunning);
        }
        let flow_type = FlowType::from_code(flow_type_code).ok_or_else(|| {
            self.inner.set_last_error("unknown flow type");
            Error::UnknownFlow(flow_type_code)
        })?;
        let params = into_map(params)?;

        let (channel, command_set, storage) = {
            let resources = self.inner.resources.lock().unwrap();
            let resources = resources
                .as_ref()
                .ok_or_else(|| Error::InvalidState("flow engine not initialized".into()))?;
            (
                resources.channel.clone(),
                resources.command_set.clone(),
                resources.storage.clone(),
            )
        };

        if !self.inner.machine.transition(FlowState::Running) {
            self.inner.set_last_error("failed to enter running state");
            return Err(Error::FlowAlreadyRunning);
        }

        let ctx = Arc::new(FlowContext::new(
            Arc::clone(&self.inner.machine),
            Arc::clone(&self.inner.signals),
            channel,
            command_set,
            storage,
            params,
        ));

        debug!(?flow_type, "starting flow");
        // Register the flow before spawning so a lightning-fast worker
        // cannot finish before it is tracked.
        *self.inner.current.lock().unwrap() = Some(CurrentFlow {
            flow_type,
            ctx: Arc::clone(&ctx),
            worker: None,
        });

        let inner = Arc::clone(&self.inner);
        let worker = std::thread::spawn(move || inner.run_flow(flow_type, ctx));
        if let Some(current) = self.inner.current.lock().unwrap().as_mut() {
            current.worker = Some(worker);
        }
        Ok(())
    }

    /// Resume a paused flow, merging `params` into the flow's parameters.
    pub fn resume_flow(&self, params: Value) -> Result<()> {
        let _api = self.inner.api.lock().unwrap();
        self.inner.resume_locked(into_map(params)?)
    }

    /// Cancel the active flow and wait for its worker to observe the
    /// cancellation and exit.
    pub fn cancel_flow(&self) -> Result<()> {
        let _api = self.inner.api.lock().unwrap();

        let current = self.inner.current.lock().unwrap().take();
        let Some(mut current) = current else {
            self.inner.machine.reset();
            return Ok(());
        };

        debug!(flow_type = ?current.flow_type, "cancelling flow");
        self.inner.machine.transition(FlowState::Cancelling);
        current.ctx.cancel();
        if let Some(worker) = current.worker.take() {
            let _ = worker.join();
        }

        self.inner.current_uid.lock().unwrap().clear();
        self.inner.machine.reset();
        Ok(())
    }

    /// Current engine state.
    pub fn state(&self) -> FlowState {
        self.inner.machine.state()
    }

    /// Code of the active flow, if any.
    pub fn current_flow_type(&self) -> Option<FlowType> {
        self.inner
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|current| current.flow_type)
    }

    /// Last error surfaced by the lifecycle API.
    pub fn last_error(&self) -> String {
        self.inner.last_error.lock().unwrap().clone()
    }
}

impl Drop for FlowEngine {
    fn drop(&mut self) {
        let _ = self.cancel_flow();
        self.inner.stop_events.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.event_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl EngineInner {
    fn channel(&self) -> Result<Arc<dyn Channel>> {
        self.resources
            .lock()
            .unwrap()
            .as_ref()
            .map(|resources| resources.channel.clone())
            .ok_or_else(|| Error::InvalidState("flow engine not initialized".into()))
    }

    fn set_last_error(&self, message: &str) {
        *self.last_error.lock().unwrap() = message.to_string();
    }

    /// Worker body: run the flow, honoring restarts, then publish the
    /// result unless cancelled.
    fn run_flow(self: Arc<Self>, flow_type: FlowType, ctx: Arc<FlowContext>) {
        loop {
            if ctx.should_restart() {
                debug!("restarting flow from the top");
                ctx.clear_restart();
                ctx.reset_card();
            }

            let outcome = execute_flow(flow_type, &ctx);

            if ctx.cancelled() {
                debug!("flow cancelled; no result emitted");
                return;
            }
            if ctx.should_restart() {
                continue;
            }

            let payload = match outcome {
                Ok(map) => map,
                Err(FlowAbort::Cancelled) => return,
                Err(FlowAbort::Fail(tag)) => {
                    let mut map = ctx.card_map();
                    map.insert(keys::ERROR.into(), json!(tag));
                    map
                }
            };
            self.signals
                .emit(signals::FLOW_RESULT, Value::Object(payload));
            self.cleanup_after_worker();
            return;
        }
    }

    fn cleanup_after_worker(&self) {
        // Dropping the JoinHandle detaches this very thread.
        let _ = self.current.lock().unwrap().take();
        self.current_uid.lock().unwrap().clear();
        self.machine.reset();
    }

    fn resume_locked(&self, params: Map<String, Value>) -> Result<()> {
        if self.machine.state() != FlowState::Paused {
            self.set_last_error("flow not paused");
            return Err(Error::InvalidState("flow not paused".into()));
        }
        let ctx = {
            let current = self.current.lock().unwrap();
            match current.as_ref() {
                Some(current) => Arc::clone(&current.ctx),
                None => {
                    self.set_last_error("no flow to resume");
                    return Err(Error::InvalidState("no flow to resume".into()));
                }
            }
        };

        self.machine.transition(FlowState::Resuming);
        ctx.resume(params);
        self.machine.transition(FlowState::Running);
        Ok(())
    }

    /// Card tap while a flow is waiting for it: auto-resume. Re-taps of
    /// the card the engine already knows about are ignored.
    fn on_target_detected(&self, uid: String) {
        {
            let mut current_uid = self.current_uid.lock().unwrap();
            if *current_uid == uid {
                return;
            }
            *current_uid = uid;
        }

        let ctx = self
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|current| Arc::clone(&current.ctx));
        let Some(ctx) = ctx else { return };
        if !ctx.is_waiting_for_card() {
            return;
        }

        debug!("card arrived while flow was waiting; auto-resuming");
        for _ in 0..PAUSE_SETTLE_RETRIES {
            if self.machine.state() == FlowState::Paused {
                let _api = self.api.lock().unwrap();
                if let Err(e) = self.resume_locked(Map::new()) {
                    warn!(error = %e, "auto-resume failed");
                }
                return;
            }
            std::thread::sleep(PAUSE_SETTLE_STEP);
        }
    }
}

fn execute_flow(flow_type: FlowType, ctx: &FlowContext) -> FlowOutput {
    match flow_type {
        FlowType::GetAppInfo => get_app_info::execute(ctx),
        FlowType::RecoverAccount => recover_account::execute(ctx),
        FlowType::LoadAccount => load_account::execute(ctx),
        FlowType::Login => login::execute(ctx),
        FlowType::ExportPublic => export_public::execute(ctx),
        FlowType::Sign => sign::execute(ctx),
        FlowType::ChangePin => change_credentials::execute(ctx, Credential::Pin),
        FlowType::ChangePuk => change_credentials::execute(ctx, Credential::Puk),
        FlowType::ChangePairing => change_credentials::execute(ctx, Credential::PairingSecret),
        FlowType::GetMetadata => metadata_flows::get_metadata(ctx),
        FlowType::StoreMetadata => metadata_flows::store_metadata(ctx),
    }
}

fn into_map(params: Value) -> Result<Map<String, Value>> {
    match params {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(Error::InvalidData("flow parameters must be an object")),
    }
}
