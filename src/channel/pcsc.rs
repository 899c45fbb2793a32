//! PC/SC channel backend for desktop readers.
//!
//! Detection runs on a dedicated thread blocked in `get_status_change`
//! with an infinite timeout; polling on a short timer is avoided because
//! it desynchronizes with upper-layer timers. The reported card UID is
//! the last two ATR bytes in lowercase hex.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use pcsc::{Card, Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State};
use tracing::{debug, warn};

use super::{uid_from_atr, Channel, ChannelErrorKind, ChannelEvent, ChannelState, EventSinks};
use crate::{Error, Result};

struct PcscInner {
    context: Context,
    sinks: EventSinks,
    card: Mutex<Option<Card>>,
    txn: Mutex<()>,
    ui_state: Mutex<ChannelState>,
    detecting: AtomicBool,
    connected_uid: Mutex<Option<String>>,
    force_rescan: AtomicBool,
}

/// Channel over the system PC/SC stack.
pub struct PcscChannel {
    inner: Arc<PcscInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl PcscChannel {
    pub fn new() -> Result<Self> {
        let context = Context::establish(Scope::User)
            .map_err(|e| Error::transport(format!("PC/SC context: {e}")))?;
        Ok(Self {
            inner: Arc::new(PcscInner {
                context,
                sinks: EventSinks::new(),
                card: Mutex::new(None),
                txn: Mutex::new(()),
                ui_state: Mutex::new(ChannelState::Idle),
                detecting: AtomicBool::new(false),
                connected_uid: Mutex::new(None),
                force_rescan: AtomicBool::new(false),
            }),
            monitor: Mutex::new(None),
        })
    }
}

impl Channel for PcscChannel {
    fn start_detection(&self) -> Result<()> {
        if self.inner.detecting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || monitor_loop(&inner));
        *self.monitor.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop_detection(&self) {
        self.inner.detecting.store(false, Ordering::SeqCst);
        // The PnP notification wakes the blocked wait on most platforms;
        // the loop also re-checks the flag after every status change.
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = self.inner.context.cancel();
            let _ = handle.join();
        }
    }

    fn subscribe(&self) -> Receiver<ChannelEvent> {
        self.inner.sinks.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.card.lock().unwrap().is_some()
    }

    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>> {
        let _txn = self.inner.txn.lock().unwrap();
        let mut card = self.inner.card.lock().unwrap();
        let handle = card
            .as_mut()
            .ok_or_else(|| Error::transport("no card connected"))?;

        let mut buffer = [0u8; 258];
        match handle.transmit(apdu, &mut buffer) {
            Ok(response) => Ok(response.to_vec()),
            Err(e @ (pcsc::Error::ResetCard | pcsc::Error::RemovedCard)) => {
                // Transport failure invalidates the connection.
                *card = None;
                drop(card);
                *self.inner.connected_uid.lock().unwrap() = None;
                self.inner.sinks.publish(ChannelEvent::TargetLost);
                Err(Error::transport(format!("card lost: {e}")))
            }
            Err(e) => Err(Error::transport(format!("transmit failed: {e}"))),
        }
    }

    fn disconnect(&self) {
        let _txn = self.inner.txn.lock().unwrap();
        if let Some(card) = self.inner.card.lock().unwrap().take() {
            let _ = card.disconnect(Disposition::ResetCard);
        }
        *self.inner.connected_uid.lock().unwrap() = None;
    }

    fn force_scan(&self) {
        self.disconnect();
        self.inner.force_rescan.store(true, Ordering::SeqCst);
        let _ = self.inner.context.cancel();
    }

    fn state(&self) -> ChannelState {
        *self.inner.ui_state.lock().unwrap()
    }

    fn set_state(&self, state: ChannelState) {
        *self.inner.ui_state.lock().unwrap() = state;
    }
}

impl Drop for PcscChannel {
    fn drop(&mut self) {
        self.stop_detection();
        self.disconnect();
    }
}

fn monitor_loop(inner: &PcscInner) {
    let mut readers_available = false;

    while inner.detecting.load(Ordering::SeqCst) {
        let readers = match inner.context.list_readers_owned() {
            Ok(readers) => readers,
            Err(e) => {
                warn!(error = %e, "failed to list readers");
                inner.sinks.publish(ChannelEvent::Error {
                    kind: ChannelErrorKind::Reader,
                    message: e.to_string(),
                });
                return;
            }
        };

        let now_available = !readers.is_empty();
        if now_available != readers_available {
            readers_available = now_available;
            inner
                .sinks
                .publish(ChannelEvent::ReaderAvailabilityChanged(now_available));
        }

        let mut reader_states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE)];
        for reader in &readers {
            reader_states.push(ReaderState::new(reader.clone(), State::UNAWARE));
        }
        for rs in &mut reader_states {
            rs.sync_current_state();
        }

        // Blocking wait; woken by card movement, reader changes or an
        // explicit cancel from stop_detection/force_scan.
        if let Err(e) = inner.context.get_status_change(None, &mut reader_states) {
            if e == pcsc::Error::Cancelled {
                if inner.force_rescan.swap(false, Ordering::SeqCst) {
                    handle_present_cards(inner, &reader_states);
                    continue;
                }
                continue;
            }
            warn!(error = %e, "status change wait failed");
            std::thread::sleep(std::time::Duration::from_millis(250));
            continue;
        }

        handle_present_cards(inner, &reader_states);
    }
}

fn handle_present_cards(inner: &PcscInner, reader_states: &[ReaderState]) {
    for rs in reader_states {
        if rs.name() == pcsc::PNP_NOTIFICATION() {
            continue;
        }
        let event_state = rs.event_state();

        if event_state.contains(State::PRESENT) && !event_state.contains(State::MUTE) {
            let uid = uid_from_atr(rs.atr());
            // The same UID while connected means auto-resume noise, not a
            // card swap.
            {
                let connected = inner.connected_uid.lock().unwrap();
                if inner.card.lock().unwrap().is_some() && connected.as_deref() == Some(&uid) {
                    continue;
                }
            }

            match connect_reader(inner, rs.name()) {
                Ok(()) => {
                    *inner.connected_uid.lock().unwrap() = Some(uid.clone());
                    debug!(%uid, "card detected");
                    inner.sinks.publish(ChannelEvent::TargetDetected { uid });
                }
                Err(e) => {
                    warn!(error = %e, "failed to connect to present card");
                }
            }
        } else if event_state.contains(State::EMPTY) {
            let was_connected = {
                let mut card = inner.card.lock().unwrap();
                card.take().is_some()
            };
            if was_connected {
                *inner.connected_uid.lock().unwrap() = None;
                debug!("card removed");
                inner.sinks.publish(ChannelEvent::TargetLost);
            }
        }
    }
}

fn connect_reader(inner: &PcscInner, reader: &std::ffi::CStr) -> Result<()> {
    let name = CString::from(reader);
    let card = inner
        .context
        .connect(&name, ShareMode::Shared, Protocols::ANY)
        .map_err(|e| Error::transport(format!("connect failed: {e}")))?;
    *inner.card.lock().unwrap() = Some(card);
    Ok(())
}
