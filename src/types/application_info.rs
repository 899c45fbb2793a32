use std::fmt;

use iso7816_tlv::ber::{Tlv, Value};
use k256::PublicKey;

use super::{find_child, get_primitive_value, tag, Version};
use crate::constants::tags;
use crate::{Error, Result};

/// Application info returned by SELECT.
///
/// An initialized card reports the full template; a pre-initialized card
/// reports only its secure-channel public key. Either `instance_uid` or
/// `secure_channel_public_key` is non-empty on a Keycard; both empty means
/// the SELECT failed.
#[derive(Debug, Clone, Default)]
pub struct ApplicationInfo {
    /// Applet is present on the card
    pub installed: bool,
    /// Card has PIN/PUK/pairing credentials
    pub initialized: bool,
    /// Instance UID (16 bytes, empty on an uninitialized card)
    pub instance_uid: Vec<u8>,
    /// Secure-channel public key (uncompressed secp256k1 point)
    pub secure_channel_public_key: Option<PublicKey>,
    /// Applet version
    pub version: Version,
    /// Remaining pairing slots
    pub available_slots: u8,
    /// Key UID (32 bytes, empty when no keys are loaded)
    pub key_uid: Vec<u8>,
}

impl ApplicationInfo {
    /// Whether the SELECT response identified a Keycard at all.
    pub fn is_keycard(&self) -> bool {
        !self.instance_uid.is_empty() || self.secure_channel_public_key.is_some()
    }

    /// Whether the card has a BIP32 master key loaded.
    pub fn key_initialized(&self) -> bool {
        !self.key_uid.is_empty()
    }

    /// Lowercase hex of the instance UID.
    pub fn instance_uid_hex(&self) -> String {
        hex::encode(&self.instance_uid)
    }

    /// Lowercase hex of the key UID.
    pub fn key_uid_hex(&self) -> String {
        hex::encode(&self.key_uid)
    }

    /// Parse the SELECT FCI. Accepts both the application-info template of
    /// an initialized card and the bare public key of a pre-initialized one.
    pub fn parse(fci: &[u8]) -> Result<Self> {
        let tlv = Tlv::from_bytes(fci)?;

        if tlv.tag() == &tag(tags::TEMPLATE_APPLICATION_INFO) {
            Self::from_template(&tlv)
        } else if tlv.tag() == &tag(tags::ECC_PUBLIC_KEY) {
            let raw = get_primitive_value(&tag(tags::ECC_PUBLIC_KEY), &tlv)?;
            let public_key = match raw.len() {
                0 => None,
                _ => Some(PublicKey::from_sec1_bytes(&raw)?),
            };
            Ok(Self {
                installed: true,
                initialized: false,
                secure_channel_public_key: public_key,
                ..Default::default()
            })
        } else {
            Err(Error::NotKeycard)
        }
    }

    fn from_template(tlv: &Tlv) -> Result<Self> {
        let children = match tlv.value() {
            Value::Constructed(tlvs) => tlvs,
            Value::Primitive(_) => {
                return Err(Error::InvalidData("application info was not constructed"))
            }
        };

        let instance_uid = find_child(children, tags::INSTANCE_UID)
            .map(|t| get_primitive_value(&tag(tags::INSTANCE_UID), t))
            .transpose()?
            .unwrap_or_default();

        let secure_channel_public_key = match find_child(children, tags::ECC_PUBLIC_KEY) {
            Some(t) => {
                let raw = get_primitive_value(&tag(tags::ECC_PUBLIC_KEY), t)?;
                if raw.is_empty() {
                    None
                } else {
                    Some(PublicKey::from_sec1_bytes(&raw)?)
                }
            }
            None => None,
        };

        // Version and remaining slots share the tag 0x02; the version comes
        // first in the template.
        let mut others = children
            .iter()
            .filter(|t| t.tag() == &tag(tags::OTHER))
            .map(|t| get_primitive_value(&tag(tags::OTHER), t));
        let version = match others.next().transpose()? {
            Some(bytes) if bytes.len() >= 2 => Version::new(bytes[0], bytes[1]),
            _ => return Err(Error::InvalidData("missing applet version")),
        };
        let available_slots = match others.next().transpose()? {
            Some(bytes) if !bytes.is_empty() => bytes[0],
            _ => return Err(Error::InvalidData("missing pairing slot count")),
        };

        let key_uid = find_child(children, tags::KEY_UID)
            .map(|t| get_primitive_value(&tag(tags::KEY_UID), t))
            .transpose()?
            .unwrap_or_default();
        if !matches!(key_uid.len(), 0 | 32) {
            return Err(Error::InvalidData("invalid key UID length"));
        }

        Ok(Self {
            installed: true,
            initialized: true,
            instance_uid,
            secure_channel_public_key,
            version,
            available_slots,
            key_uid,
        })
    }
}

impl fmt::Display for ApplicationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Application Info:")?;
        writeln!(f, "  Instance UID: {}", self.instance_uid_hex())?;
        writeln!(f, "  Initialized: {}", self.initialized)?;
        writeln!(f, "  Version: {}", self.version)?;
        writeln!(f, "  Remaining pairing slots: {}", self.available_slots)?;
        write!(f, "  Key UID: {}", self.key_uid_hex())
    }
}
