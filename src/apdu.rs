//! APDU command/response framing.
//!
//! Short APDUs only; the Keycard applet never exceeds a 255-byte body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Status word constants
pub mod status {
    /// Normal processing
    pub const SW_OK: u16 = 0x9000;
    /// Security status not satisfied (secure channel or PIN required)
    pub const SW_SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
    /// Conditions of use not satisfied
    pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
    /// Wrong data
    pub const SW_WRONG_DATA: u16 = 0x6A80;
    /// File full (no pairing slots available)
    pub const SW_FILE_FULL: u16 = 0x6A84;
    /// Incorrect P1/P2
    pub const SW_INCORRECT_P1P2: u16 = 0x6A86;
    /// Referenced data not found
    pub const SW_REFERENCED_DATA_NOT_FOUND: u16 = 0x6A88;
    /// Instruction not supported (INIT on an initialized card)
    pub const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
    /// Card internal error
    pub const SW_INTERNAL_ERROR: u16 = 0x6F00;
    /// Card internal error variant seen when the applet state machine is
    /// mis-initialized (GET STATUS skipped after channel open)
    pub const SW_INTERNAL_ERROR_ALT: u16 = 0x6F05;
    /// First byte of the wrong PIN/PUK counter family (0x63Cx)
    pub const SW1_WRONG_PIN: u8 = 0x63;
    /// High nibble marker of the retry counter in SW2
    pub const SW2_RETRY_MARKER: u8 = 0xC0;
}

/// Two trailing status bytes of an APDU response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    pub sw1: u8,
    pub sw2: u8,
}

impl StatusWord {
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Combined 16-bit status
    pub const fn to_u16(self) -> u16 {
        ((self.sw1 as u16) << 8) | self.sw2 as u16
    }

    pub const fn is_success(self) -> bool {
        self.to_u16() == status::SW_OK
    }

    /// Retry counter when this is a 0x63Cx wrong-PIN/PUK status
    pub const fn retry_count(self) -> Option<u8> {
        if self.sw1 == status::SW1_WRONG_PIN
            && self.sw2 & 0xF0 == status::SW2_RETRY_MARKER
        {
            Some(self.sw2 & 0x0F)
        } else {
            None
        }
    }
}

impl From<u16> for StatusWord {
    fn from(sw: u16) -> Self {
        Self::new((sw >> 8) as u8, sw as u8)
    }
}

impl std::fmt::Display for StatusWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}{:02X}", self.sw1, self.sw2)
    }
}

/// One APDU command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Option<Bytes>,
    le: Option<u8>,
}

impl Command {
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub const fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    pub const fn class(&self) -> u8 {
        self.cla
    }

    pub const fn instruction(&self) -> u8 {
        self.ins
    }

    pub const fn p1(&self) -> u8 {
        self.p1
    }

    pub const fn p2(&self) -> u8 {
        self.p2
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Serialize to wire format
    pub fn to_bytes(&self) -> Bytes {
        let body_len = self.data.as_ref().map_or(0, Bytes::len);
        let mut buf = BytesMut::with_capacity(4 + 1 + body_len + 1);
        buf.put_u8(self.cla);
        buf.put_u8(self.ins);
        buf.put_u8(self.p1);
        buf.put_u8(self.p2);
        if let Some(data) = &self.data {
            buf.put_u8(data.len() as u8);
            buf.put_slice(data);
        }
        if let Some(le) = self.le {
            buf.put_u8(le);
        }
        buf.freeze()
    }

    /// Parse wire format back into a command. Used by the secure channel
    /// to wrap an already-built command.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::InvalidData("APDU command shorter than header"));
        }
        let mut cmd = Self::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        match bytes.len() {
            4 => {}
            5 => cmd.le = Some(bytes[4]),
            _ => {
                let lc = bytes[4] as usize;
                if bytes.len() < 5 + lc {
                    return Err(Error::InvalidData("APDU body shorter than Lc"));
                }
                cmd.data = Some(Bytes::copy_from_slice(&bytes[5..5 + lc]));
                match bytes.len() - 5 - lc {
                    0 => {}
                    1 => cmd.le = Some(bytes[5 + lc]),
                    _ => return Err(Error::InvalidData("trailing bytes after APDU body")),
                }
            }
        }
        Ok(cmd)
    }
}

/// One APDU response, payload plus SW1SW2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    payload: Bytes,
    status: StatusWord,
}

impl Response {
    pub fn new(payload: impl Into<Bytes>, status: StatusWord) -> Self {
        Self {
            payload: payload.into(),
            status,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::InvalidData("APDU response shorter than SW1SW2"));
        }
        let (payload, sw) = bytes.split_at(bytes.len() - 2);
        Ok(Self {
            payload: Bytes::copy_from_slice(payload),
            status: StatusWord::new(sw[0], sw[1]),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 2);
        buf.put_slice(&self.payload);
        buf.put_u8(self.status.sw1);
        buf.put_u8(self.status.sw2);
        buf.freeze()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub const fn status(&self) -> StatusWord {
        self.status
    }

    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip_with_data_and_le() {
        let cmd = Command::new(0x80, 0xC2, 0x01, 0x00)
            .with_data(vec![0xAA, 0xBB, 0xCC])
            .with_le(0);
        let bytes = cmd.to_bytes();
        assert_eq!(&bytes[..], &[0x80, 0xC2, 0x01, 0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x00]);
        assert_eq!(Command::from_bytes(&bytes).unwrap(), cmd);
    }

    #[test]
    fn command_roundtrip_header_only() {
        let cmd = Command::new(0x00, 0xA4, 0x04, 0x00);
        assert_eq!(Command::from_bytes(&cmd.to_bytes()).unwrap(), cmd);
    }

    #[test]
    fn response_split() {
        let resp = Response::from_bytes(&[0x01, 0x02, 0x90, 0x00]).unwrap();
        assert_eq!(resp.payload(), &[0x01, 0x02]);
        assert!(resp.is_success());
    }

    #[test]
    fn retry_count_extraction() {
        assert_eq!(StatusWord::new(0x63, 0xC2).retry_count(), Some(2));
        assert_eq!(StatusWord::new(0x63, 0xC0).retry_count(), Some(0));
        assert_eq!(StatusWord::new(0x69, 0x82).retry_count(), None);
    }
}
