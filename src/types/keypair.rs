use iso7816_tlv::ber::{Tlv, Value};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use serde_json::{json, Map, Value as Json};

use super::{find_child, get_primitive_value, tag};
use crate::constants::tags;
use crate::crypto::{address_from_public_key, public_from_private};
use crate::{Error, Result};

/// Keypair parsed from the card's export template (tag 0xA1).
///
/// The card omits the public key when exporting private-only material; in
/// that case it is recomputed from the private key so the address is always
/// derivable.
#[derive(Clone, Default)]
pub struct Keypair {
    /// Public key (uncompressed 65-byte point on the wire)
    pub public_key: Option<PublicKey>,
    /// Private key, present for private exports only
    pub private_key: Option<SecretKey>,
    /// Chain code, present for extended exports only
    pub chain_code: Option<[u8; 32]>,
}

impl Keypair {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let tlv = Tlv::from_bytes(bytes)?;
        if tlv.tag() != &tag(tags::TEMPLATE_KEYPAIR) {
            return Err(Error::InvalidData("not a keypair template"));
        }
        let children = match tlv.value() {
            Value::Constructed(tlvs) => tlvs,
            Value::Primitive(_) => {
                return Err(Error::InvalidData("keypair template was not constructed"))
            }
        };

        let mut keypair = Self::default();

        if let Some(t) = find_child(children, tags::ECC_PUBLIC_KEY) {
            let raw = get_primitive_value(&tag(tags::ECC_PUBLIC_KEY), t)?;
            if !raw.is_empty() {
                keypair.public_key = Some(PublicKey::from_sec1_bytes(&raw)?);
            }
        }
        if let Some(t) = find_child(children, tags::ECC_PRIVATE_KEY) {
            let raw = get_primitive_value(&tag(tags::ECC_PRIVATE_KEY), t)?;
            keypair.private_key = Some(SecretKey::from_slice(&raw)?);
        }
        if let Some(t) = find_child(children, tags::CHAIN_CODE) {
            let raw = get_primitive_value(&tag(tags::CHAIN_CODE), t)?;
            keypair.chain_code = Some(
                raw.try_into()
                    .map_err(|_| Error::InvalidData("invalid chain code length"))?,
            );
        }

        if keypair.public_key.is_none() {
            match &keypair.private_key {
                Some(private) => {
                    keypair.public_key = Some(public_from_private(&private.to_bytes())?);
                }
                None => return Err(Error::InvalidData("keypair template carried no key")),
            }
        }

        Ok(keypair)
    }

    /// Uncompressed SEC1 encoding of the public key.
    pub fn public_key_bytes(&self) -> Option<Vec<u8>> {
        self.public_key
            .as_ref()
            .map(|pk| pk.to_encoded_point(false).as_bytes().to_vec())
    }

    /// Ethereum-style address derived from the public key.
    pub fn address(&self) -> Option<[u8; 20]> {
        self.public_key.as_ref().map(address_from_public_key)
    }

    /// JSON view used in flow results and signal payloads.
    pub fn to_json(&self) -> Json {
        let mut map = Map::new();
        if let Some(public) = self.public_key_bytes() {
            map.insert(
                "public-key".into(),
                json!(format!("0x{}", hex::encode(public))),
            );
        }
        if let Some(private) = &self.private_key {
            map.insert(
                "private-key".into(),
                json!(format!("0x{}", hex::encode(private.to_bytes()))),
            );
        }
        if let Some(chain) = &self.chain_code {
            map.insert("chain-code".into(), json!(format!("0x{}", hex::encode(chain))));
        }
        if let Some(address) = self.address() {
            map.insert("address".into(), json!(format!("0x{}", hex::encode(address))));
        }
        Json::Object(map)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print private material.
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_bytes().map(hex::encode))
            .field("private_key", &self.private_key.is_some())
            .field("chain_code", &self.chain_code.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iso7816_tlv::ber::{Tag, Tlv, Value};

    fn template(children: Vec<Tlv>) -> Vec<u8> {
        Tlv::new(
            Tag::try_from(tags::TEMPLATE_KEYPAIR).unwrap(),
            Value::Constructed(children),
        )
        .unwrap()
        .to_vec()
    }

    fn primitive(t: u8, bytes: Vec<u8>) -> Tlv {
        Tlv::new(Tag::try_from(t).unwrap(), Value::Primitive(bytes)).unwrap()
    }

    #[test]
    fn parses_full_keypair() {
        let private = SecretKey::random(&mut rand::thread_rng());
        let public = private.public_key().to_encoded_point(false);
        let bytes = template(vec![
            primitive(tags::ECC_PUBLIC_KEY, public.as_bytes().to_vec()),
            primitive(tags::ECC_PRIVATE_KEY, private.to_bytes().to_vec()),
            primitive(tags::CHAIN_CODE, vec![7u8; 32]),
        ]);

        let keypair = Keypair::parse(&bytes).unwrap();
        assert_eq!(keypair.public_key_bytes().unwrap(), public.as_bytes());
        assert!(keypair.private_key.is_some());
        assert_eq!(keypair.chain_code, Some([7u8; 32]));
        assert!(keypair.address().is_some());
    }

    #[test]
    fn derives_public_key_when_missing() {
        let private = SecretKey::random(&mut rand::thread_rng());
        let bytes = template(vec![primitive(
            tags::ECC_PRIVATE_KEY,
            private.to_bytes().to_vec(),
        )]);

        let keypair = Keypair::parse(&bytes).unwrap();
        assert_eq!(keypair.public_key, Some(private.public_key()));
    }

    #[test]
    fn rejects_empty_template() {
        let bytes = template(vec![]);
        assert!(Keypair::parse(&bytes).is_err());
    }
}
