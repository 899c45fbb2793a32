//! Applet identifiers, instruction codes, TLV tags and derivation paths.

/// AID of the Keycard applet
pub const KEYCARD_AID: &[u8] = b"\xA0\x00\x00\x08\x04\x00\x01\x01";

/// Pairing password used when the caller supplies none
pub const DEFAULT_PAIRING_PASSWORD: &str = "KeycardDefaultPairing";

/// ISO 7816 interindustry class byte (SELECT)
pub const CLA_ISO7816: u8 = 0x00;
/// GlobalPlatform class byte used by every Keycard command
pub const CLA_GP: u8 = 0x80;

/// PIN length accepted by INIT and CHANGE PIN
pub const PIN_LENGTH: usize = 6;
/// PUK length accepted by INIT and CHANGE PUK
pub const PUK_LENGTH: usize = 12;

/// Public data slot holding the metadata blob
pub const SLOT_PUBLIC_DATA: u8 = 0x00;

pub mod ins {
    //! Instruction bytes of the Keycard applet

    pub const SELECT: u8 = 0xA4;
    pub const OPEN_SECURE_CHANNEL: u8 = 0x10;
    pub const MUTUALLY_AUTHENTICATE: u8 = 0x11;
    pub const PAIR: u8 = 0x12;
    pub const UNPAIR: u8 = 0x13;
    pub const VERIFY_PIN: u8 = 0x20;
    pub const CHANGE_PIN: u8 = 0x21;
    pub const UNBLOCK_PIN: u8 = 0x22;
    pub const SIGN: u8 = 0xC0;
    pub const EXPORT_KEY: u8 = 0xC2;
    pub const GET_DATA: u8 = 0xCA;
    pub const LOAD_KEY: u8 = 0xD0;
    pub const GENERATE_MNEMONIC: u8 = 0xD2;
    pub const REMOVE_KEY: u8 = 0xD3;
    pub const GENERATE_KEY: u8 = 0xD4;
    pub const STORE_DATA: u8 = 0xE2;
    pub const GET_STATUS: u8 = 0xF2;
    pub const FACTORY_RESET: u8 = 0xFD;
    pub const INIT: u8 = 0xFE;
}

pub mod tags {
    //! BER-TLV tags used in Keycard responses

    /// Signature template containing the public key and the ECDSA signature
    pub const TEMPLATE_SIGNATURE: u8 = 0xA0;
    /// Keypair template containing public/private key and optional chain code
    pub const TEMPLATE_KEYPAIR: u8 = 0xA1;
    /// Application status template (retry counters, key-initialized flag)
    pub const TEMPLATE_APPLICATION_STATUS: u8 = 0xA3;
    /// Application info template returned by SELECT
    pub const TEMPLATE_APPLICATION_INFO: u8 = 0xA4;

    /// Instance UID (16 bytes)
    pub const INSTANCE_UID: u8 = 0x8F;
    /// ECC public key (65 bytes uncompressed, or empty)
    pub const ECC_PUBLIC_KEY: u8 = 0x80;
    /// ECC private key (32 bytes)
    pub const ECC_PRIVATE_KEY: u8 = 0x81;
    /// Chain code (32 bytes)
    pub const CHAIN_CODE: u8 = 0x82;
    /// Application version / remaining pairing slots / retry counters
    pub const OTHER: u8 = 0x02;
    /// Key UID (32 bytes)
    pub const KEY_UID: u8 = 0x8E;
    /// Capabilities (1 byte)
    pub const CAPABILITIES: u8 = 0x8D;
    /// ECDSA signature (DER SEQUENCE of r and s)
    pub const ECDSA_SIGNATURE: u8 = 0x30;
    /// Key initialized flag (0xFF when a key is loaded)
    pub const KEY_INITIALIZED: u8 = 0x01;
}

pub mod paths {
    //! BIP44 derivation paths used by the account flows

    pub const MASTER: &str = "m";
    pub const WALLET_ROOT: &str = "m/44'/60'/0'/0";
    pub const WALLET: &str = "m/44'/60'/0'/0/0";
    pub const EIP1581: &str = "m/43'/60'/1581'";
    pub const WHISPER: &str = "m/43'/60'/1581'/0'/0";
    pub const ENCRYPTION: &str = "m/43'/60'/1581'/1'/0";
}
