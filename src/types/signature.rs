use iso7816_tlv::ber::{Tlv, Value};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::PublicKey;
use serde_json::{json, Value as Json};

use super::{find_child, get_primitive_value, tag};
use crate::constants::tags;
use crate::{Error, Result};

/// ECDSA signature parsed from the card's signature template (tag 0xA0):
/// the signing public key plus the DER SEQUENCE of r and s. The recovery
/// id is recomputed on the host by trial recovery against the prehash.
#[derive(Debug, Clone)]
pub struct EcdsaSignature {
    /// Public key the card signed with
    pub public_key: PublicKey,
    /// The (r, s) signature, low-s normalized
    pub signature: Signature,
    /// Ethereum-style recovery id (0 or 1)
    pub recovery_id: u8,
}

impl EcdsaSignature {
    /// Parse the signature template and recover the recovery id for the
    /// given 32-byte prehash.
    pub fn parse(bytes: &[u8], prehash: &[u8; 32]) -> Result<Self> {
        let tlv = Tlv::from_bytes(bytes)?;
        if tlv.tag() != &tag(tags::TEMPLATE_SIGNATURE) {
            return Err(Error::InvalidData("not a signature template"));
        }
        let children = match tlv.value() {
            Value::Constructed(tlvs) => tlvs,
            Value::Primitive(_) => {
                return Err(Error::InvalidData("signature template was not constructed"))
            }
        };

        let public_raw = find_child(children, tags::ECC_PUBLIC_KEY)
            .ok_or(Error::InvalidData("signature template missing public key"))
            .and_then(|t| get_primitive_value(&tag(tags::ECC_PUBLIC_KEY), t))?;
        let public_key = PublicKey::from_sec1_bytes(&public_raw)?;

        let der = find_child(children, tags::ECDSA_SIGNATURE)
            .ok_or(Error::InvalidData("signature template missing signature"))?;
        let (r, s) = match der.value() {
            Value::Constructed(ints) if ints.len() >= 2 => (
                scalar_bytes(&get_primitive_value(&tag(tags::OTHER), &ints[0])?)?,
                scalar_bytes(&get_primitive_value(&tag(tags::OTHER), &ints[1])?)?,
            ),
            _ => return Err(Error::InvalidData("malformed ECDSA SEQUENCE")),
        };

        let mut signature = Signature::from_scalars(r, s)?;
        if let Some(normalized) = signature.normalize_s() {
            signature = normalized;
        }

        let recovery_id = RecoveryId::trial_recovery_from_prehash(
            &VerifyingKey::from(&public_key),
            prehash,
            &signature,
        )?;

        Ok(Self {
            public_key,
            signature,
            recovery_id: recovery_id.to_byte(),
        })
    }

    /// JSON view used by the sign flow: r, s and v.
    pub fn to_json(&self) -> Json {
        let (r, s) = self.signature.split_bytes();
        json!({
            "r": format!("0x{}", hex::encode(r)),
            "s": format!("0x{}", hex::encode(s)),
            "v": self.recovery_id,
        })
    }
}

// DER INTEGERs may carry a leading zero byte; scalars must be exactly 32.
fn scalar_bytes(raw: &[u8]) -> Result<[u8; 32]> {
    let trimmed = match raw {
        [0, rest @ ..] if rest.len() == 32 => rest,
        other => other,
    };
    if trimmed.len() > 32 {
        return Err(Error::InvalidData("ECDSA scalar longer than 32 bytes"));
    }
    let mut out = [0u8; 32];
    out[32 - trimmed.len()..].copy_from_slice(trimmed);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iso7816_tlv::ber::Tag;
    use k256::ecdsa::{signature::hazmat::PrehashSigner, SigningKey};
    use k256::elliptic_curve::sec1::ToEncodedPoint;

    fn der_integer(bytes: &[u8]) -> Tlv {
        // Minimal DER INTEGER: prepend a zero when the high bit is set.
        let mut value = Vec::new();
        if bytes[0] & 0x80 != 0 {
            value.push(0);
        }
        value.extend_from_slice(bytes);
        Tlv::new(Tag::try_from(tags::OTHER).unwrap(), Value::Primitive(value)).unwrap()
    }

    #[test]
    fn parses_and_recovers() {
        let signing = SigningKey::random(&mut rand::thread_rng());
        let prehash = [0x42u8; 32];
        let signature: Signature = signing.sign_prehash(&prehash).unwrap();

        let (r, s) = signature.split_bytes();
        let public = signing.verifying_key().to_encoded_point(false);

        let template = Tlv::new(
            Tag::try_from(tags::TEMPLATE_SIGNATURE).unwrap(),
            Value::Constructed(vec![
                Tlv::new(
                    Tag::try_from(tags::ECC_PUBLIC_KEY).unwrap(),
                    Value::Primitive(public.as_bytes().to_vec()),
                )
                .unwrap(),
                Tlv::new(
                    Tag::try_from(tags::ECDSA_SIGNATURE).unwrap(),
                    Value::Constructed(vec![der_integer(r.as_slice()), der_integer(s.as_slice())]),
                )
                .unwrap(),
            ]),
        )
        .unwrap()
        .to_vec();

        let parsed = EcdsaSignature::parse(&template, &prehash).unwrap();
        assert!(parsed.recovery_id < 2);
        assert_eq!(
            parsed.public_key.to_encoded_point(false).as_bytes(),
            public.as_bytes()
        );
    }
}
