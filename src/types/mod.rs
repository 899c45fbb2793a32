//! Typed views of card data structures.

mod application_info;
mod application_status;
mod keypair;
mod pairing_info;
mod secrets;
mod signature;
mod version;

pub use application_info::ApplicationInfo;
pub use application_status::ApplicationStatus;
pub use keypair::Keypair;
pub use pairing_info::PairingInfo;
pub use secrets::Secrets;
pub use signature::EcdsaSignature;
pub use version::Version;

use iso7816_tlv::ber::{Tag, Tlv, Value};

use crate::Error;

pub(crate) fn tag(tag: u8) -> Tag {
    // Single-byte tags are always representable.
    Tag::try_from(tag).unwrap()
}

pub(crate) fn get_primitive_value(expected: &Tag, tlv: &Tlv) -> Result<Vec<u8>, Error> {
    if expected != tlv.tag() {
        return Err(Error::InvalidData("unexpected TLV tag"));
    }
    match tlv.value() {
        Value::Primitive(bytes) => Ok(bytes.to_vec()),
        Value::Constructed(_) => Err(Error::InvalidData("expected primitive TLV value")),
    }
}

pub(crate) fn find_child<'a>(tlvs: &'a [Tlv], wanted: u8) -> Option<&'a Tlv> {
    let wanted = tag(wanted);
    tlvs.iter().find(|tlv| tlv.tag() == &wanted)
}

/// Emit one BER-TLV element with a single-byte tag, using the long length
/// form when the content exceeds 127 bytes.
pub(crate) fn encode_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    match content.len() {
        len @ 0..=0x7F => out.push(len as u8),
        len @ 0x80..=0xFF => {
            out.push(0x81);
            out.push(len as u8);
        }
        len => {
            out.push(0x82);
            out.push((len >> 8) as u8);
            out.push(len as u8);
        }
    }
    out.extend_from_slice(content);
    out
}
