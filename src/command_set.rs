//! Typed wrapper over the Keycard APDU surface.
//!
//! A `CommandSet` owns the live secure-channel crypto state for one card
//! connection. The session manager constructs a fresh one per insertion;
//! the flow engine keeps one alive for the life of the engine. Either way
//! the command set is the only component that touches raw APDUs.

use std::sync::Arc;

use bytes::Bytes;
use coins_bip32::path::DerivationPath;
use k256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::apdu::{status, Command, Response};
use crate::channel::Channel;
use crate::constants::{ins, CLA_GP, CLA_ISO7816, KEYCARD_AID};
use crate::crypto::{
    calculate_cryptogram, generate_ecdh_shared_secret, generate_pairing_token, one_shot_encrypt,
    Challenge, Cryptogram,
};
use crate::error::StatusCode;
use crate::secure_channel::{host_public_key_bytes, SecureChannel};
use crate::types::{
    ApplicationInfo, ApplicationStatus, EcdsaSignature, Keypair, PairingInfo, Secrets,
};
use crate::{Error, Result};

/// What EXPORT KEY should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOption {
    /// Private and public key
    PrivateAndPublic = 0x00,
    /// Public key only
    PublicOnly = 0x01,
    /// Public key plus chain code (applet >= 3.1)
    ExtendedPublic = 0x02,
}

// EXPORT KEY / SIGN P1: derive from master, without or with moving the
// card's current-key pointer.
const P1_DERIVE_TEMPORARY: u8 = 0x01;
const P1_DERIVE_PERSISTENT: u8 = 0x02;

/// Typed APDU surface over one channel.
pub struct CommandSet {
    channel: Arc<dyn Channel>,
    secure: SecureChannel,
    card_public_key: Option<PublicKey>,
    application_info: Option<ApplicationInfo>,
    application_status: Option<ApplicationStatus>,
}

impl CommandSet {
    /// Create a fresh command set with no secure-channel state.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            secure: SecureChannel::new(),
            card_public_key: None,
            application_info: None,
            application_status: None,
        }
    }

    /// SELECT the Keycard applet and parse its application info.
    ///
    /// Selecting closes any card-side secure channel, so the host state is
    /// reset alongside.
    pub fn select(&mut self) -> Result<ApplicationInfo> {
        self.secure.reset();

        let cmd = Command::new(CLA_ISO7816, ins::SELECT, 0x04, 0x00)
            .with_data(Bytes::from_static(KEYCARD_AID))
            .with_le(0);
        let resp = self.checked(cmd)?;

        let info = ApplicationInfo::parse(resp.payload())?;
        if !info.is_keycard() {
            return Err(Error::NotKeycard);
        }

        debug!(instance_uid = %info.instance_uid_hex(), version = %info.version, "applet selected");
        self.card_public_key = info.secure_channel_public_key;
        self.application_info = Some(info.clone());
        Ok(info)
    }

    /// INIT the card with PIN, PUK and pairing password. Only valid on a
    /// pre-initialized card; structurally invalidates the connection.
    pub fn init(&mut self, secrets: &Secrets) -> Result<()> {
        let card_public_key = self
            .card_public_key
            .ok_or(Error::InvalidData("card public key required for INIT"))?;

        let host_private_key = SecretKey::random(&mut rand::thread_rng());
        let shared_secret = generate_ecdh_shared_secret(&host_private_key, &card_public_key);
        let mut data = bytes::BytesMut::from(&secrets.to_bytes()[..]);
        let payload = one_shot_encrypt(&host_private_key.public_key(), &shared_secret, &mut data);

        let cmd = Command::new(CLA_GP, ins::INIT, 0x00, 0x00)
            .with_data(payload)
            .with_le(0);
        let resp = self.transmit(cmd)?;
        match resp.status().to_u16() {
            status::SW_OK => Ok(()),
            status::SW_INS_NOT_SUPPORTED => {
                Err(Error::InvalidState("card is already initialized".into()))
            }
            sw => Err(self.map_status(sw)),
        }
    }

    /// Two-stage PAIR handshake, claiming one of the card's pairing slots.
    pub fn pair(&mut self, password: &str) -> Result<PairingInfo> {
        debug!("pairing with card");
        let token = generate_pairing_token(password);

        let challenge = SecureChannel::random_challenge();
        let cmd = Command::new(CLA_GP, ins::PAIR, 0x00, 0x00)
            .with_data(challenge.to_vec())
            .with_le(0);
        let resp = self.transmit(cmd)?;
        let payload = match resp.status().to_u16() {
            status::SW_OK => resp.payload().to_vec(),
            status::SW_FILE_FULL => return Err(Error::NoAvailablePairingSlots),
            status::SW_SECURITY_STATUS_NOT_SATISFIED => return Err(Error::WrongPairingPassword),
            sw => return Err(self.map_status(sw)),
        };
        if payload.len() != 64 {
            return Err(Error::InvalidData("invalid PAIR first-stage response"));
        }

        let card_cryptogram = Cryptogram::clone_from_slice(&payload[..32]);
        let card_challenge = Challenge::clone_from_slice(&payload[32..]);

        // A mismatched cryptogram means the card derived the token from a
        // different pairing password.
        if card_cryptogram != calculate_cryptogram(&token, &challenge) {
            warn!("card cryptogram mismatch; wrong pairing password");
            return Err(Error::WrongPairingPassword);
        }

        let client_cryptogram = calculate_cryptogram(&token, &card_challenge);
        let cmd = Command::new(CLA_GP, ins::PAIR, 0x01, 0x00)
            .with_data(client_cryptogram.to_vec())
            .with_le(0);
        let resp = self.transmit(cmd)?;
        let payload = match resp.status().to_u16() {
            status::SW_OK => resp.payload().to_vec(),
            status::SW_FILE_FULL => return Err(Error::NoAvailablePairingSlots),
            status::SW_SECURITY_STATUS_NOT_SATISFIED => return Err(Error::WrongPairingPassword),
            sw => return Err(self.map_status(sw)),
        };
        if payload.len() != 33 {
            return Err(Error::InvalidData("invalid PAIR final-stage response"));
        }

        let index = payload[0];
        let mut hasher = Sha256::new();
        hasher.update(token);
        hasher.update(&payload[1..]);
        let key: [u8; 32] = hasher.finalize().into();

        debug!(index, "pairing successful");
        Ok(PairingInfo::new(key, index))
    }

    /// OPEN SECURE CHANNEL with the given pairing, including the mutual
    /// authentication round.
    pub fn open_secure_channel(&mut self, pairing: &PairingInfo) -> Result<()> {
        let card_public_key = self
            .card_public_key
            .ok_or(Error::PairingRequired)?;

        self.secure.reset();
        let host_private_key = SecretKey::random(&mut rand::thread_rng());

        let cmd = Command::new(CLA_GP, ins::OPEN_SECURE_CHANNEL, pairing.index, 0x00)
            .with_data(host_public_key_bytes(&host_private_key))
            .with_le(0);
        let resp = self.checked(cmd)?;

        self.secure
            .open(&host_private_key, &card_public_key, pairing, resp.payload())?;

        // Mutual authentication proves both sides derived the same keys.
        let challenge = SecureChannel::random_challenge();
        let cmd = Command::new(CLA_GP, ins::MUTUALLY_AUTHENTICATE, 0x00, 0x00)
            .with_data(challenge.to_vec())
            .with_le(0);
        match self.transmit(cmd) {
            Ok(resp) if resp.is_success() && resp.payload().len() == 32 => {
                debug!("secure channel established");
                Ok(())
            }
            _ => {
                self.secure.reset();
                Err(Error::MutualAuthenticationFailed)
            }
        }
    }

    /// VERIFY PIN. On success subsequent full-security operations are
    /// permitted until the channel closes.
    pub fn verify_pin(&mut self, pin: &str) -> Result<()> {
        let cmd = Command::new(CLA_GP, ins::VERIFY_PIN, 0x00, 0x00)
            .with_data(Bytes::copy_from_slice(pin.as_bytes()));
        let resp = self.transmit(cmd)?;
        if resp.is_success() {
            self.secure.set_authenticated(true);
            return Ok(());
        }
        match resp.status().retry_count() {
            Some(0) => Err(Error::PinBlocked),
            Some(remaining) => Err(Error::WrongPin { remaining }),
            None => Err(self.map_status(resp.status().to_u16())),
        }
    }

    /// CHANGE PIN (P1=0x00).
    pub fn change_pin(&mut self, new_pin: &str) -> Result<()> {
        let cmd = Command::new(CLA_GP, ins::CHANGE_PIN, 0x00, 0x00)
            .with_data(Bytes::copy_from_slice(new_pin.as_bytes()));
        self.checked(cmd).map(drop)
    }

    /// CHANGE PUK (P1=0x01).
    pub fn change_puk(&mut self, new_puk: &str) -> Result<()> {
        let cmd = Command::new(CLA_GP, ins::CHANGE_PIN, 0x01, 0x00)
            .with_data(Bytes::copy_from_slice(new_puk.as_bytes()));
        self.checked(cmd).map(drop)
    }

    /// CHANGE PAIRING SECRET (P1=0x02); sends the derived 32-byte token.
    pub fn change_pairing_secret(&mut self, new_password: &str) -> Result<()> {
        let token = generate_pairing_token(new_password);
        let cmd = Command::new(CLA_GP, ins::CHANGE_PIN, 0x02, 0x00).with_data(token.to_vec());
        self.checked(cmd).map(drop)
    }

    /// UNBLOCK PIN using the PUK, setting a new PIN.
    pub fn unblock_pin(&mut self, puk: &str, new_pin: &str) -> Result<()> {
        let mut data = Vec::with_capacity(puk.len() + new_pin.len());
        data.extend_from_slice(puk.as_bytes());
        data.extend_from_slice(new_pin.as_bytes());
        let cmd = Command::new(CLA_GP, ins::UNBLOCK_PIN, 0x00, 0x00).with_data(data);
        let resp = self.transmit(cmd)?;
        if resp.is_success() {
            return Ok(());
        }
        match resp.status().retry_count() {
            Some(0) => Err(Error::PukBlocked),
            Some(remaining) => Err(Error::WrongPuk { remaining }),
            None => Err(self.map_status(resp.status().to_u16())),
        }
    }

    /// GET STATUS with P1=0x00 (application); the result is cached.
    pub fn get_status(&mut self) -> Result<ApplicationStatus> {
        let cmd = Command::new(CLA_GP, ins::GET_STATUS, 0x00, 0x00).with_le(0);
        let resp = self.checked(cmd)?;
        let status = ApplicationStatus::parse(resp.payload())?;
        self.application_status = Some(status.clone());
        Ok(status)
    }

    /// GET STATUS with P1=0x01 (current derivation path).
    pub fn get_key_path(&mut self) -> Result<Vec<u32>> {
        let cmd = Command::new(CLA_GP, ins::GET_STATUS, 0x01, 0x00).with_le(0);
        let resp = self.checked(cmd)?;
        let payload = resp.payload();
        if payload.len() % 4 != 0 {
            return Err(Error::InvalidData("malformed key path"));
        }
        Ok(payload
            .chunks(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect())
    }

    /// GENERATE MNEMONIC, returning word indices into the BIP39 wordlist.
    /// `checksum_words` is 4..=8, i.e. mnemonic length divided by three.
    pub fn generate_mnemonic(&mut self, checksum_words: u8) -> Result<Vec<u16>> {
        if !(4..=8).contains(&checksum_words) {
            return Err(Error::InvalidData("checksum length must be 4..=8"));
        }
        let cmd = Command::new(CLA_GP, ins::GENERATE_MNEMONIC, checksum_words, 0x00).with_le(0);
        let resp = self.checked(cmd)?;
        let payload = resp.payload();
        if payload.len() % 2 != 0 {
            return Err(Error::InvalidData("malformed mnemonic indices"));
        }
        Ok(payload
            .chunks(2)
            .map(|c| u16::from_be_bytes(c.try_into().unwrap()))
            .collect())
    }

    /// LOAD KEY with a 64-byte BIP39 seed (P1=0x03); returns the key UID.
    pub fn load_seed(&mut self, seed: &[u8; 64]) -> Result<[u8; 32]> {
        let cmd = Command::new(CLA_GP, ins::LOAD_KEY, 0x03, 0x00)
            .with_data(Bytes::copy_from_slice(seed))
            .with_le(0);
        let resp = self.checked(cmd)?;
        resp.payload()
            .try_into()
            .map_err(|_| Error::InvalidData("invalid key UID length"))
    }

    /// GENERATE KEY on-card, overwriting any existing master key; returns
    /// the new key UID.
    pub fn generate_key(&mut self) -> Result<[u8; 32]> {
        let cmd = Command::new(CLA_GP, ins::GENERATE_KEY, 0x00, 0x00).with_le(0);
        let resp = self.checked(cmd)?;
        resp.payload()
            .try_into()
            .map_err(|_| Error::InvalidData("invalid key UID length"))
    }

    /// REMOVE KEY, wiping the current master key from the card.
    pub fn remove_key(&mut self) -> Result<()> {
        let cmd = Command::new(CLA_GP, ins::REMOVE_KEY, 0x00, 0x00);
        self.checked(cmd).map(drop)
    }

    /// FACTORY RESET. Irreversible; requires no authentication. The
    /// reset wipes the card-side session, so the host secure channel is
    /// dropped first and the command travels in the clear.
    pub fn factory_reset(&mut self) -> Result<()> {
        self.secure.reset();
        let cmd = Command::new(CLA_GP, ins::FACTORY_RESET, 0xAA, 0x55);
        self.checked(cmd).map(drop)
    }

    /// EXPORT KEY derived from the master key at `path`.
    ///
    /// `make_current` moves the card's current-key pointer; the first
    /// export after opening a secure channel must pass true to seed it.
    pub fn export_key(
        &mut self,
        make_current: bool,
        path: &DerivationPath,
        what: ExportOption,
    ) -> Result<Keypair> {
        let p1 = if make_current {
            P1_DERIVE_PERSISTENT
        } else {
            P1_DERIVE_TEMPORARY
        };
        let cmd = Command::new(CLA_GP, ins::EXPORT_KEY, p1, what as u8)
            .with_data(path_to_bytes(path))
            .with_le(0);
        let resp = self.checked(cmd)?;
        Keypair::parse(resp.payload())
    }

    /// EXPORT KEY with the extended-public variant (applet >= 3.1).
    pub fn export_key_extended(
        &mut self,
        make_current: bool,
        path: &DerivationPath,
    ) -> Result<Keypair> {
        self.export_key(make_current, path, ExportOption::ExtendedPublic)
    }

    /// SIGN a 32-byte hash with the key at `path`.
    pub fn sign(&mut self, hash: &[u8; 32], path: &DerivationPath) -> Result<EcdsaSignature> {
        let path_bytes = path_to_bytes(path);
        let p1 = if path_bytes.is_empty() {
            0x00
        } else {
            P1_DERIVE_TEMPORARY
        };
        let mut data = Vec::with_capacity(32 + path_bytes.len());
        data.extend_from_slice(hash);
        data.extend_from_slice(&path_bytes);
        let cmd = Command::new(CLA_GP, ins::SIGN, p1, 0x00)
            .with_data(data)
            .with_le(0);
        let resp = self.checked(cmd)?;
        EcdsaSignature::parse(resp.payload(), hash)
    }

    /// GET DATA from a persistent record slot.
    pub fn get_data(&mut self, slot: u8) -> Result<Vec<u8>> {
        let cmd = Command::new(CLA_GP, ins::GET_DATA, slot, 0x00).with_le(0);
        let resp = self.checked(cmd)?;
        Ok(resp.payload().to_vec())
    }

    /// STORE DATA into a persistent record slot.
    pub fn store_data(&mut self, slot: u8, data: &[u8]) -> Result<()> {
        let cmd = Command::new(CLA_GP, ins::STORE_DATA, slot, 0x00)
            .with_data(Bytes::copy_from_slice(data));
        self.checked(cmd).map(drop)
    }

    /// UNPAIR the given slot index.
    pub fn unpair(&mut self, index: u8) -> Result<()> {
        let cmd = Command::new(CLA_GP, ins::UNPAIR, index, 0x00);
        self.checked(cmd).map(drop)
    }

    /// Forget the secure-channel keys without closing the card connection.
    pub fn reset_secure_channel(&mut self) {
        self.secure.reset();
    }

    /// Whether the secure channel is currently open.
    pub fn is_secure_channel_open(&self) -> bool {
        self.secure.is_open()
    }

    /// Whether the PIN has been verified on the open channel.
    pub fn is_authenticated(&self) -> bool {
        self.secure.is_authenticated()
    }

    /// Last application status fetched from the card, without an APDU.
    pub fn cached_application_status(&self) -> Option<&ApplicationStatus> {
        self.application_status.as_ref()
    }

    /// Application info from the last SELECT, without an APDU.
    pub fn application_info(&self) -> Option<&ApplicationInfo> {
        self.application_info.as_ref()
    }

    fn transmit(&mut self, command: Command) -> Result<Response> {
        let wire = if self.secure.is_open() {
            self.secure.protect_command(&command)?.to_bytes()
        } else {
            command.to_bytes()
        };

        let raw = self.channel.transmit(&wire)?;
        let resp = Response::from_bytes(&raw)?;

        if self.secure.is_open() {
            self.secure.process_response(&resp)
        } else {
            Ok(resp)
        }
    }

    fn checked(&mut self, command: Command) -> Result<Response> {
        let resp = self.transmit(command)?;
        if resp.is_success() {
            Ok(resp)
        } else {
            Err(self.map_status(resp.status().to_u16()))
        }
    }

    fn map_status(&self, sw: u16) -> Error {
        match sw {
            status::SW_FILE_FULL => Error::NoAvailablePairingSlots,
            status::SW_SECURITY_STATUS_NOT_SATISFIED => Error::SecureChannelRequired,
            status::SW_CONDITIONS_NOT_SATISFIED => Error::ConditionsNotSatisfied,
            status::SW_INTERNAL_ERROR | status::SW_INTERNAL_ERROR_ALT => {
                Error::CardInternal(StatusCode(sw))
            }
            other => Error::UnexpectedStatus(StatusCode(other)),
        }
    }
}

fn path_to_bytes(path: &DerivationPath) -> Vec<u8> {
    path.iter()
        .flat_map(|component| component.to_be_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_serialization_is_big_endian() {
        let path: DerivationPath = "m/44'/60'/0'/0".parse().unwrap();
        let bytes = path_to_bytes(&path);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &[0x80, 0x00, 0x00, 0x2C]);
        assert_eq!(&bytes[4..8], &[0x80, 0x00, 0x00, 0x3C]);
        assert_eq!(&bytes[12..], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn master_path_is_empty() {
        let path: DerivationPath = "m".parse().unwrap();
        assert!(path_to_bytes(&path).is_empty());
    }
}
