//! Stable parameter keys, signal tags and error tags used by flows.

/// Parameter and payload keys (kebab-case, stable across releases).
pub mod keys {
    pub const ERROR: &str = "error";
    pub const INSTANCE_UID: &str = "instance-uid";
    pub const KEY_UID: &str = "key-uid";
    pub const FREE_SLOTS: &str = "free-pairing-slots";
    pub const PIN_RETRIES: &str = "pin-retries";
    pub const PUK_RETRIES: &str = "puk-retries";
    pub const PAIRED: &str = "paired";
    pub const APP_INFO: &str = "app-info";
    pub const INITIALIZED: &str = "initialized";
    pub const KEY_INITIALIZED: &str = "key-initialized";
    pub const VERSION: &str = "version";
    pub const PIN: &str = "pin";
    pub const NEW_PIN: &str = "new-pin";
    pub const NEW_PUK: &str = "new-puk";
    pub const NEW_PAIRING: &str = "new-pairing";
    pub const PAIRING_PASS: &str = "pairing-pass";
    pub const MNEMONIC: &str = "mnemonic";
    pub const MNEMONIC_LENGTH: &str = "mnemonic-length";
    pub const MNEMONIC_INDEXES: &str = "mnemonic-indexes";
    pub const PASSPHRASE: &str = "passphrase";
    pub const OVERWRITE: &str = "overwrite";
    pub const FACTORY_RESET: &str = "factory reset";
    pub const TX_HASH: &str = "tx-hash";
    pub const BIP44_PATH: &str = "bip44-path";
    pub const TX_SIGNATURE: &str = "tx-signature";
    pub const CARD_NAME: &str = "card-name";
    pub const CARD_METADATA: &str = "card-metadata";
    pub const PATHS: &str = "paths";
    pub const EXPORTED_KEY: &str = "exported-key";
    pub const WHISPER_KEY: &str = "whisper-key";
    pub const ENCRYPTION_KEY: &str = "encryption-key";
    pub const EIP1581_KEY: &str = "eip1581-key";
    pub const WALLET_ROOT_KEY: &str = "wallet-root-key";
    pub const WALLET_KEY: &str = "wallet-key";
    pub const MASTER_KEY: &str = "master-key";
}

/// Signal type tags emitted by the flow engine.
pub mod signals {
    pub const INSERT_CARD: &str = "insert-card";
    pub const CARD_INSERTED: &str = "card-inserted";
    pub const ENTER_PAIRING: &str = "enter-pairing";
    pub const ENTER_PIN: &str = "enter-pin";
    pub const ENTER_NEW_PIN: &str = "enter-new-pin";
    pub const ENTER_NEW_PUK: &str = "enter-new-puk";
    pub const ENTER_NEW_PAIRING: &str = "enter-new-pairing";
    pub const ENTER_PATH: &str = "enter-path";
    pub const ENTER_MNEMONIC: &str = "enter-mnemonic";
    pub const ENTER_NAME: &str = "enter-name";
    pub const SWAP_CARD: &str = "swap-card";
    pub const FLOW_RESULT: &str = "flow-result";
}

/// Error tags carried inside pause events and flow results.
pub mod errors {
    pub const OK: &str = "ok";
    pub const CONNECTION_ERROR: &str = "connection-error";
    pub const ENTER_PIN: &str = "enter-pin";
    pub const WRONG_PIN: &str = "wrong-pin";
    pub const PIN_BLOCKED: &str = "pin-blocked";
    pub const ENTER_PAIRING: &str = "enter-pairing";
    pub const NO_KEYS: &str = "no-keys";
    pub const HAS_KEYS: &str = "has-keys";
    pub const REQUIRE_INIT: &str = "require-init";
    pub const LOADING_KEYS: &str = "loading-keys";
    pub const CANCELLED: &str = "cancelled";
    pub const CARD_ERROR: &str = "card-error";
    pub const SELECT_FAILED: &str = "select-failed";
    pub const AUTH_FAILED: &str = "auth-failed";
    pub const CHANGE_FAILED: &str = "change-failed";
    pub const EXPORT_FAILED: &str = "export-failed";
    pub const GENERATE_FAILED: &str = "generate-failed";
    pub const LOAD_FAILED: &str = "load-failed";
    pub const MISSING_CREDENTIALS: &str = "missing-credentials";
    pub const FACTORY_RESET_FAILED: &str = "factory-reset-failed";
}
