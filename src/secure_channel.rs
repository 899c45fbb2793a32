//! Host side of the Keycard Secure Channel Protocol.
//!
//! The channel is keyed by ECDH between an ephemeral host key and the
//! card's secure-channel key, mixed with the 32-byte pairing key. After
//! OPEN SECURE CHANNEL every APDU payload travels AES-256-CBC encrypted
//! with a chained IV that doubles as the message MAC.

use bytes::{Bytes, BytesMut};
use k256::{PublicKey, SecretKey};
use rand::RngCore;
use tracing::{debug, trace, warn};
use zeroize::Zeroize;

use crate::apdu::{Command, Response};
use crate::crypto::{
    calculate_mac, decrypt_data, derive_session_keys, encrypt_data, generate_ecdh_shared_secret,
    ApduMeta, Challenge, ScpIv, ScpKey,
};
use crate::types::PairingInfo;
use crate::{Error, Result};

/// Symmetric session keys, wiped on drop.
#[derive(Clone)]
struct Keys {
    enc: ScpKey,
    mac: ScpKey,
}

impl Drop for Keys {
    fn drop(&mut self) {
        self.enc.as_mut_slice().zeroize();
        self.mac.as_mut_slice().zeroize();
    }
}

/// Live secure-channel state owned by a command set.
///
/// `open()` installs the session keys; `reset()` is the only other way to
/// purge them short of dropping the owner.
pub(crate) struct SecureChannel {
    keys: Option<Keys>,
    iv: ScpIv,
    authenticated: bool,
}

impl SecureChannel {
    pub(crate) fn new() -> Self {
        Self {
            keys: None,
            iv: ScpIv::default(),
            authenticated: false,
        }
    }

    /// Whether the secure channel is established.
    pub(crate) fn is_open(&self) -> bool {
        self.keys.is_some()
    }

    /// Derive session keys from the OPEN SECURE CHANNEL response.
    ///
    /// `payload` is the 48-byte card response: a 32-byte challenge followed
    /// by the initial 16-byte IV.
    pub(crate) fn open(
        &mut self,
        host_private_key: &SecretKey,
        card_public_key: &PublicKey,
        pairing: &PairingInfo,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() != 48 {
            return Err(Error::InvalidData("invalid open secure channel response"));
        }

        let shared_secret = generate_ecdh_shared_secret(host_private_key, card_public_key);
        let challenge = Challenge::clone_from_slice(&payload[..32]);
        let (enc, mac) = derive_session_keys(&shared_secret, &pairing.key, &challenge);

        self.keys = Some(Keys { enc, mac });
        self.iv = *ScpIv::from_slice(&payload[32..48]);
        self.authenticated = false;

        debug!("secure channel session keys derived");
        Ok(())
    }

    /// Forget the session keys without touching the transport.
    pub(crate) fn reset(&mut self) {
        self.keys = None;
        self.iv = ScpIv::default();
        self.authenticated = false;
        trace!("secure channel state reset");
    }

    pub(crate) fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Random 32-byte challenge for pairing and mutual authentication.
    pub(crate) fn random_challenge() -> Challenge {
        let mut challenge = Challenge::default();
        rand::thread_rng().fill_bytes(&mut challenge);
        challenge
    }

    /// Wrap a command for the open channel: encrypt the payload and
    /// prepend the running MAC, which becomes the next IV.
    pub(crate) fn protect_command(&mut self, command: &Command) -> Result<Command> {
        let keys = self
            .keys
            .as_ref()
            .ok_or(Error::SecureChannelRequired)?
            .clone();

        let mut payload = BytesMut::from(command.data());
        let encrypted = encrypt_data(&mut payload, &keys.enc, &self.iv);

        let mut meta = ApduMeta::default();
        meta[0] = command.class();
        meta[1] = command.instruction();
        meta[2] = command.p1();
        meta[3] = command.p2();
        meta[4] = (encrypted.len() + 16) as u8;

        self.iv = calculate_mac(&meta, &encrypted, &keys.mac);

        let mut data = BytesMut::with_capacity(16 + encrypted.len());
        data.extend_from_slice(&self.iv);
        data.extend_from_slice(&encrypted);

        Ok(Command::new(
            command.class(),
            command.instruction(),
            command.p1(),
            command.p2(),
        )
        .with_data(data.freeze()))
    }

    /// Unwrap a response from the open channel: decrypt with the command
    /// MAC as IV and verify the response MAC, which becomes the next IV.
    pub(crate) fn process_response(&mut self, response: &Response) -> Result<Response> {
        let keys = self
            .keys
            .as_ref()
            .ok_or(Error::SecureChannelRequired)?
            .clone();

        // Non-success outer statuses are not encrypted.
        if !response.is_success() {
            return Ok(response.clone());
        }

        let payload = response.payload();
        if payload.len() < 16 {
            warn!(len = payload.len(), "secure channel response too short");
            return Err(Error::InvalidData("secure channel response too short"));
        }

        let (rmac, rdata) = payload.split_at(16);

        let mut meta = ApduMeta::default();
        meta[0] = payload.len() as u8;

        let mut to_decrypt = BytesMut::from(rdata);
        let plaintext = decrypt_data(&mut to_decrypt, &keys.enc, &self.iv)?;

        self.iv = calculate_mac(&meta, rdata, &keys.mac);
        if rmac != self.iv.as_slice() {
            warn!("MAC verification failed for secure channel response");
            return Err(Error::InvalidData("invalid response MAC"));
        }

        Response::from_bytes(&plaintext)
    }
}

/// Encode the OPEN SECURE CHANNEL request payload for an ephemeral key.
pub(crate) fn host_public_key_bytes(host_private_key: &SecretKey) -> Bytes {
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    Bytes::copy_from_slice(
        host_private_key
            .public_key()
            .to_encoded_point(false)
            .as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    fn channel_with(enc: &str, mac: &str, iv: &str) -> SecureChannel {
        let mut channel = SecureChannel::new();
        channel.keys = Some(Keys {
            enc: *ScpKey::from_slice(&unhex(enc)),
            mac: *ScpKey::from_slice(&unhex(mac)),
        });
        channel.iv = *ScpIv::from_slice(&unhex(iv));
        channel
    }

    #[test]
    fn test_protect_command() {
        let mut channel = channel_with(
            "FDBCB1637597CF3F8F5E8263007D4E45F64C12D44066D4576EB1443D60AEF441",
            "2FB70219E6635EE0958AB3F7A428BA87E8CD6E6F873A5725A55F25B102D0F1F7",
            "627E64358FA9BDCDAD4442BD8006E0A5",
        );

        let data = unhex("D545A5E95963B6BCED86A6AE826D34C5E06AC64A1217EFFA1415A96674A82500");
        let command = Command::new(0x80, 0x11, 0x00, 0x00).with_data(data);

        let protected = channel.protect_command(&command).unwrap();

        let expected = unhex(
            "BA796BF8FAD1FD50407B87127B94F5023EF8903AE926EAD8A204F961B8A0EDAEE7CCCFE7F7F6380CE2C6F188E598E4468B7DEDD0E807C18CCBDA71A55F3E1F9A",
        );
        assert_eq!(protected.data(), &expected[..]);

        let expected_iv = unhex("BA796BF8FAD1FD50407B87127B94F502");
        assert_eq!(channel.iv.to_vec(), expected_iv);
    }

    #[test]
    fn reset_purges_keys() {
        let mut channel = channel_with(
            "FDBCB1637597CF3F8F5E8263007D4E45F64C12D44066D4576EB1443D60AEF441",
            "2FB70219E6635EE0958AB3F7A428BA87E8CD6E6F873A5725A55F25B102D0F1F7",
            "627E64358FA9BDCDAD4442BD8006E0A5",
        );
        assert!(channel.is_open());
        channel.reset();
        assert!(!channel.is_open());
        let cmd = Command::new(0x80, 0x20, 0x00, 0x00);
        assert!(channel.protect_command(&cmd).is_err());
    }
}
