use std::fmt;

use iso7816_tlv::ber::{Tlv, Value};

use super::{get_primitive_value, tag};
use crate::constants::tags;
use crate::{Error, Result};

/// Application status returned by GET STATUS with P1=0x00.
///
/// The retry counters use -1 as the "unknown / not fetched" sentinel so a
/// cached default can be told apart from a real zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationStatus {
    /// PIN retry count, -1 when unknown
    pub pin_retry_count: i8,
    /// PUK retry count, -1 when unknown
    pub puk_retry_count: i8,
    /// Whether a master key is loaded
    pub key_initialized: bool,
    /// Current derivation path, when fetched separately
    pub path: Option<Vec<u32>>,
}

impl Default for ApplicationStatus {
    fn default() -> Self {
        Self {
            pin_retry_count: -1,
            puk_retry_count: -1,
            key_initialized: false,
            path: None,
        }
    }
}

impl ApplicationStatus {
    /// Whether the status carries real counters from the card.
    pub fn is_known(&self) -> bool {
        self.pin_retry_count >= 0
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let tlv = Tlv::from_bytes(bytes)?;
        if tlv.tag() != &tag(tags::TEMPLATE_APPLICATION_STATUS) {
            return Err(Error::InvalidData("not an application status template"));
        }

        match tlv.value() {
            Value::Primitive(_) => Err(Error::InvalidData("status template was not constructed")),
            Value::Constructed(tlvs) => {
                if tlvs.len() < 3 {
                    return Err(Error::InvalidData("truncated application status"));
                }
                let pin = get_primitive_value(&tag(tags::OTHER), &tlvs[0])?;
                let puk = get_primitive_value(&tag(tags::OTHER), &tlvs[1])?;
                let key = get_primitive_value(&tag(tags::KEY_INITIALIZED), &tlvs[2])?;
                if pin.is_empty() || puk.is_empty() || key.is_empty() {
                    return Err(Error::InvalidData("empty application status field"));
                }
                Ok(Self {
                    pin_retry_count: pin[0] as i8,
                    puk_retry_count: puk[0] as i8,
                    key_initialized: key[0] == 0xFF,
                    path: None,
                })
            }
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PIN retries: {}, PUK retries: {}, key initialized: {}",
            self.pin_retry_count, self.puk_retry_count, self.key_initialized
        )
    }
}
