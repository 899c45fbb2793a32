use bytes::{BufMut, Bytes, BytesMut};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{DEFAULT_PAIRING_PASSWORD, PIN_LENGTH, PUK_LENGTH};
use crate::crypto::{generate_pairing_token, PairingToken};
use crate::{Error, Result};

/// Transient PIN/PUK/pairing-password bundle passed to INIT.
///
/// Never persisted; the whole bundle is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secrets {
    pin: String,
    puk: String,
    pairing_password: String,
    #[zeroize(skip)]
    pairing_token: PairingToken,
}

impl Secrets {
    /// Build the INIT secrets. The PIN must be 6 ASCII digits and the PUK
    /// 12; an empty pairing password selects the well-known default.
    pub fn new(pin: &str, puk: &str, pairing_password: &str) -> Result<Self> {
        if pin.len() != PIN_LENGTH || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidData("PIN must be 6 ASCII digits"));
        }
        if puk.len() != PUK_LENGTH || !puk.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidData("PUK must be 12 ASCII digits"));
        }

        let pairing_password = if pairing_password.is_empty() {
            DEFAULT_PAIRING_PASSWORD
        } else {
            pairing_password
        };

        Ok(Self {
            pin: pin.to_string(),
            puk: puk.to_string(),
            pairing_password: pairing_password.to_string(),
            pairing_token: generate_pairing_token(pairing_password),
        })
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn puk(&self) -> &str {
        &self.puk
    }

    pub fn pairing_password(&self) -> &str {
        &self.pairing_password
    }

    /// Wire encoding carried inside the INIT payload:
    /// PIN (6) | PUK (12) | pairing token (32).
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PIN_LENGTH + PUK_LENGTH + self.pairing_token.len());
        buf.put_slice(self.pin.as_bytes());
        buf.put_slice(self.puk.as_bytes());
        buf.put_slice(&self.pairing_token);
        buf.freeze()
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secrets(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_pin_puk_token() {
        let secrets = Secrets::new("123456", "123456123456", "pass").unwrap();
        let bytes = secrets.to_bytes();
        assert_eq!(bytes.len(), 6 + 12 + 32);
        assert_eq!(&bytes[..6], b"123456");
        assert_eq!(&bytes[6..18], b"123456123456");
    }

    #[test]
    fn empty_pairing_password_uses_default() {
        let secrets = Secrets::new("123456", "123456123456", "").unwrap();
        assert_eq!(secrets.pairing_password(), DEFAULT_PAIRING_PASSWORD);
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(Secrets::new("12345", "123456123456", "").is_err());
        assert!(Secrets::new("123456", "12345612345", "").is_err());
        assert!(Secrets::new("12345a", "123456123456", "").is_err());
    }
}
