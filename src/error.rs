//! Error types for Keycard host operations.
//!
//! A single crate-level enum covers transport, card-protocol,
//! authentication, pairing and state errors so that every layer can
//! propagate with `?` and the facades can map variants onto their
//! stable error tags.

use thiserror::Error;

/// Result type for Keycard host operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Keycard host operations
#[derive(Debug, Error)]
pub enum Error {
    //
    // Transport
    //
    /// Reader or card vanished, short read, timeout
    #[error("transport error: {0}")]
    Transport(String),

    //
    // Card protocol
    //
    /// Unexpected status word
    #[error("unexpected status word {0}")]
    UnexpectedStatus(StatusCode),

    /// Card-internal error, often symptomatic of a skipped GET STATUS
    /// after opening the secure channel
    #[error("card internal error {0}")]
    CardInternal(StatusCode),

    /// Malformed TLV or payload
    #[error("invalid card data: {0}")]
    InvalidData(&'static str),

    /// TLV encoding/decoding error
    #[error("TLV error: {0:?}")]
    Tlv(iso7816_tlv::TlvError),

    /// The selected applet is not a Keycard
    #[error("selected applet is not a Keycard")]
    NotKeycard,

    //
    // Authentication
    //
    /// Wrong PIN, with remaining attempts extracted from SW 0x63Cx
    #[error("wrong PIN ({remaining} attempts remaining)")]
    WrongPin {
        /// Attempts remaining before the PIN blocks
        remaining: u8,
    },

    /// Wrong PUK, with remaining attempts extracted from SW 0x63Cx
    #[error("wrong PUK ({remaining} attempts remaining)")]
    WrongPuk {
        /// Attempts remaining before the PUK blocks
        remaining: u8,
    },

    /// PIN is blocked; only the PUK can recover the card
    #[error("PIN is blocked")]
    PinBlocked,

    /// PUK is blocked; the card instance is unusable
    #[error("PUK is blocked")]
    PukBlocked,

    /// Operation requires an open secure channel (SW 0x6982)
    #[error("secure channel required")]
    SecureChannelRequired,

    /// Conditions of use not satisfied (SW 0x6985)
    #[error("conditions not satisfied")]
    ConditionsNotSatisfied,

    //
    // Pairing
    //
    /// All pairing slots on the card are taken (SW 0x6A84)
    #[error("no available pairing slots")]
    NoAvailablePairingSlots,

    /// The pairing password was rejected by the card
    #[error("wrong pairing password")]
    WrongPairingPassword,

    /// Card cryptogram verification failed during pairing
    #[error("pairing failed")]
    PairingFailed,

    /// Mutual authentication failed when opening the secure channel
    #[error("mutual authentication failed")]
    MutualAuthenticationFailed,

    /// No pairing information available for the operation
    #[error("pairing information required")]
    PairingRequired,

    //
    // State
    //
    /// Service started twice without an intervening stop
    #[error("service already started")]
    AlreadyStarted,

    /// A flow is already running
    #[error("flow already running")]
    FlowAlreadyRunning,

    /// Unknown flow type code
    #[error("unknown flow type {0}")]
    UnknownFlow(i32),

    /// Operation invoked in a state that forbids it
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Flow cancelled by the caller
    #[error("flow cancelled")]
    Cancelled,

    //
    // External
    //
    /// Filesystem error from the pairing store
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error from the pairing store or signal payloads
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// BIP32 path error
    #[error(transparent)]
    Bip32(#[from] coins_bip32::Bip32Error),

    /// BIP39 wordlist error
    #[error(transparent)]
    Wordlist(#[from] coins_bip39::WordlistError),

    /// Elliptic curve error
    #[error(transparent)]
    EllipticCurve(#[from] k256::elliptic_curve::Error),

    /// ECDSA error
    #[error(transparent)]
    Ecdsa(#[from] k256::ecdsa::Error),

    /// Unpadding error when decrypting a secure-channel payload
    #[error("unpadding error when decrypting")]
    Unpad(cipher::block_padding::UnpadError),

    /// Other error with a message
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create an error with a dynamic message
    pub fn message<S: Into<String>>(message: S) -> Self {
        Self::Message(message.into())
    }

    /// Create a transport error with a dynamic message
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Whether the error indicates the transport (not the card protocol)
    /// failed; such errors invalidate the current connection.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<cipher::block_padding::UnpadError> for Error {
    fn from(err: cipher::block_padding::UnpadError) -> Self {
        Self::Unpad(err)
    }
}

impl From<iso7816_tlv::TlvError> for Error {
    fn from(error: iso7816_tlv::TlvError) -> Self {
        Self::Tlv(error)
    }
}

/// A status word rendered as four hex digits in error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}
