//! Channel contract: reader/target detection, APDU transport, state events.
//!
//! Backends present a uniform event model regardless of how they learn
//! about cards (PC/SC status polling on desktop, platform-delivered tag
//! events on mobile). The facades share one channel via `Arc<dyn Channel>`.

mod mock;
#[cfg(feature = "pcsc-backend")]
mod pcsc;

pub use mock::{CardState, MockKeycard};
#[cfg(feature = "pcsc-backend")]
pub use pcsc::PcscChannel;

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::Result;

/// Events published by a channel to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// At least one reader exists (true) or none do (false)
    ReaderAvailabilityChanged(bool),
    /// A card became reachable; fired once per no-card-to-card transition
    TargetDetected {
        /// Lowercase hex identifier: last two ATR bytes on PC/SC, the tag
        /// UID on NFC
        uid: String,
    },
    /// The card is no longer reachable
    TargetLost,
    /// Unrecoverable reader-stack failure
    Error {
        kind: ChannelErrorKind,
        message: String,
    },
}

/// Classification of channel errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// Reader stack failure
    Reader,
    /// Card vanished, reset or timed out mid-exchange
    Transport,
    /// Short read or malformed frame
    Protocol,
}

/// UI-visible channel state. Transitioning to `Idle` closes any platform
/// NFC session (on iOS this dismisses the system NFC drawer); backends
/// without such a session treat this as bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Idle,
    WaitingForCard,
    Connected,
}

/// Transport abstraction shared by the session manager and the flow engine.
///
/// Implementations must serialize concurrent `transmit` calls so APDU
/// exchanges never interleave, and must suppress re-taps of the same UID
/// while the prior connection is still up.
pub trait Channel: Send + Sync {
    /// Start target detection. Idempotent; may be restarted after a stop.
    fn start_detection(&self) -> Result<()>;

    /// Stop target detection. Idempotent.
    fn stop_detection(&self);

    /// Subscribe to channel events. Every subscriber sees every event in
    /// publication order.
    fn subscribe(&self) -> Receiver<ChannelEvent>;

    /// Whether a card is currently reachable.
    fn is_connected(&self) -> bool;

    /// Send one APDU and return the raw response including SW1SW2.
    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>>;

    /// Tear down the current target connection.
    fn disconnect(&self);

    /// Drop the current target and re-arm detection so `TargetDetected`
    /// fires again for the same physical card. Callers use this after
    /// INIT or factory reset invalidated the connection.
    fn force_scan(&self);

    /// Current UI-visible state.
    fn state(&self) -> ChannelState;

    /// Drive the UI-visible state.
    fn set_state(&self, state: ChannelState);
}

/// UID of a card as derived from its ATR on PC/SC: the last two bytes in
/// lowercase hex.
pub fn uid_from_atr(atr: &[u8]) -> String {
    match atr {
        [.., a, b] => hex::encode([*a, *b]),
        short => hex::encode(short),
    }
}

/// Fan-out of channel events to any number of subscribers.
pub(crate) struct EventSinks {
    senders: Mutex<Vec<Sender<ChannelEvent>>>,
}

impl EventSinks {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<ChannelEvent> {
        let (tx, rx) = mpsc::channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    pub(crate) fn publish(&self, event: ChannelEvent) {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
