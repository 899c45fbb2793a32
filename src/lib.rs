//! Host-side library for driving Keycard-class smart cards.
//!
//! The crate exposes two coordinated facades on top of a shared
//! [`Channel`]: a [`SessionManager`] for long-lived per-command access and a
//! [`FlowEngine`] for multi-step, user-guided procedures (login, account
//! load, recover, sign, credential changes, metadata). Both drive the card
//! through a [`CommandSet`] that owns the live secure-channel state, persist
//! pairings in a [`PairingStore`] and broadcast structured events over a
//! [`SignalBus`].
//!
//! Transport backends implement the [`Channel`] trait. A PC/SC backend is
//! available behind the `pcsc-backend` feature; [`MockKeycard`] emulates the
//! applet in-process and is what the test-suite (and headless consumers)
//! drive.

mod apdu;
mod channel;
mod command_set;
mod constants;
mod crypto;
mod error;
mod metadata;
mod secure_channel;
mod session;
mod signal;
mod storage;
mod types;

pub mod flow;

pub use apdu::{Command, Response, StatusWord};
pub use coins_bip32::path::DerivationPath;
pub use channel::{CardState, Channel, ChannelErrorKind, ChannelEvent, ChannelState, MockKeycard};
#[cfg(feature = "pcsc-backend")]
pub use channel::PcscChannel;
pub use command_set::{CommandSet, ExportOption};
pub use constants::{paths, DEFAULT_PAIRING_PASSWORD, KEYCARD_AID};
pub use error::{Error, Result, StatusCode};
pub use flow::{FlowEngine, FlowState, FlowType};
pub use metadata::Metadata;
pub use session::{LoginKeys, RecoverKeys, SessionManager, SessionState, StatusSnapshot};
pub use signal::SignalBus;
pub use storage::PairingStore;
pub use types::{
    ApplicationInfo, ApplicationStatus, EcdsaSignature, Keypair, PairingInfo, Secrets, Version,
};
