//! On-card metadata blob: wallet name plus derived account indices.
//!
//! Wire format (public data slot 0x00):
//! byte 0 is `0x20 | name_len` (version 1 in the top three bits, name
//! length 0..=20 in the lower five), followed by the UTF-8 name, followed
//! by zero or more (start, count) pairs of LEB128-encoded u32 where each
//! pair expands to the run start, start+1, ..., start+count.

use serde_json::{json, Value as Json};

use crate::constants::paths;
use crate::{Error, Result};

const VERSION_BITS: u8 = 0x20;
const MAX_NAME_LEN: usize = 20;

/// Wallet names/paths stored on-card.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    /// Card name, at most 20 bytes of UTF-8
    pub name: String,
    /// Sorted last components of the wallet BIP44 paths
    pub wallet_indices: Vec<u32>,
}

impl Metadata {
    /// Build metadata from a name and full wallet paths. Every path must
    /// start with the wallet-root prefix and end in a plain u32 component.
    pub fn from_paths(name: &str, wallet_paths: &[String]) -> Result<Self> {
        let mut indices = Vec::with_capacity(wallet_paths.len());
        for path in wallet_paths {
            if !path.starts_with(paths::WALLET_ROOT) {
                return Err(Error::InvalidData(
                    "wallet path does not start with the wallet root",
                ));
            }
            let last = path
                .rsplit('/')
                .next()
                .and_then(|c| c.parse::<u32>().ok())
                .ok_or(Error::InvalidData("wallet path has no numeric component"))?;
            indices.push(last);
        }
        indices.sort_unstable();
        indices.dedup();

        Ok(Self {
            name: name.to_string(),
            wallet_indices: indices,
        })
    }

    /// Full BIP44 paths reconstructed from the stored indices.
    pub fn wallet_paths(&self) -> Vec<String> {
        self.wallet_indices
            .iter()
            .map(|i| format!("{}/{}", paths::WALLET_ROOT, i))
            .collect()
    }

    /// Encode to the on-card blob.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.name.as_bytes();
        if name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidData("metadata name longer than 20 bytes"));
        }

        let mut out = Vec::with_capacity(1 + name.len() + self.wallet_indices.len() * 2);
        out.push(VERSION_BITS | name.len() as u8);
        out.extend_from_slice(name);

        // Runs of consecutive indices collapse into (start, count).
        let mut sorted = self.wallet_indices.clone();
        sorted.sort_unstable();
        sorted.dedup();

        let mut i = 0;
        while i < sorted.len() {
            let start = sorted[i];
            let mut count = 0u32;
            while i + 1 < sorted.len() && sorted[i + 1] == sorted[i] + 1 {
                count += 1;
                i += 1;
            }
            write_leb128(&mut out, start);
            write_leb128(&mut out, count);
            i += 1;
        }

        Ok(out)
    }

    /// Decode the on-card blob.
    pub fn decode(blob: &[u8]) -> Result<Self> {
        if blob.is_empty() {
            return Err(Error::InvalidData("empty metadata blob"));
        }
        if blob[0] & 0xE0 != VERSION_BITS {
            return Err(Error::InvalidData("unsupported metadata version"));
        }

        let name_len = (blob[0] & 0x1F) as usize;
        if blob.len() < 1 + name_len {
            return Err(Error::InvalidData("metadata name truncated"));
        }
        let name = std::str::from_utf8(&blob[1..1 + name_len])
            .map_err(|_| Error::InvalidData("metadata name is not UTF-8"))?
            .to_string();

        let mut indices = Vec::new();
        let mut offset = 1 + name_len;
        while offset < blob.len() {
            let (start, read) = read_leb128(&blob[offset..])?;
            offset += read;
            let (count, read) = read_leb128(&blob[offset..])?;
            offset += read;
            // The public slot holds a few hundred bytes at most; a huge
            // run can only be a malformed blob.
            if count > 1 << 16 {
                return Err(Error::InvalidData("implausible wallet index run"));
            }
            for i in 0..=count {
                let index = start
                    .checked_add(i)
                    .ok_or(Error::InvalidData("wallet index overflow"))?;
                indices.push(index);
            }
        }

        Ok(Self {
            name,
            wallet_indices: indices,
        })
    }

    /// JSON view used by the metadata flows and the session snapshot.
    pub fn to_json(&self) -> Json {
        json!({
            "name": self.name,
            "paths": self.wallet_paths(),
        })
    }
}

fn write_leb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_leb128(bytes: &[u8]) -> Result<(u32, usize)> {
    let mut value = 0u32;
    let mut shift = 0u32;
    for (i, byte) in bytes.iter().enumerate() {
        if shift >= 32 {
            return Err(Error::InvalidData("LEB128 value overflows u32"));
        }
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(Error::InvalidData("truncated LEB128 value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128_roundtrip() {
        for value in [0u32, 1, 127, 128, 300, 16384, u32::MAX] {
            let mut buf = Vec::new();
            write_leb128(&mut buf, value);
            let (back, read) = read_leb128(&buf).unwrap();
            assert_eq!(back, value);
            assert_eq!(read, buf.len());
        }
    }

    #[test]
    fn leb128_rejects_truncation() {
        assert!(read_leb128(&[0x80]).is_err());
        assert!(read_leb128(&[]).is_err());
    }

    #[test]
    fn header_byte_carries_version_and_name_len() {
        let metadata = Metadata {
            name: "card".into(),
            wallet_indices: vec![],
        };
        let blob = metadata.encode().unwrap();
        assert_eq!(blob[0], 0x24);
        assert_eq!(&blob[1..], b"card");
    }

    #[test]
    fn consecutive_indices_collapse_to_one_run() {
        let metadata = Metadata {
            name: String::new(),
            wallet_indices: vec![0, 1, 2, 3],
        };
        let blob = metadata.encode().unwrap();
        // header, start=0, count=3
        assert_eq!(blob, vec![0x20, 0x00, 0x03]);
    }

    #[test]
    fn roundtrip_mixed_runs() {
        let metadata = Metadata {
            name: "wallet".into(),
            wallet_indices: vec![0, 1, 2, 5, 9, 10, 300],
        };
        let decoded = Metadata::decode(&metadata.encode().unwrap()).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn name_at_limit_roundtrips() {
        let name = "x".repeat(20);
        let metadata = Metadata {
            name: name.clone(),
            wallet_indices: vec![7],
        };
        let decoded = Metadata::decode(&metadata.encode().unwrap()).unwrap();
        assert_eq!(decoded.name, name);
        assert!(Metadata {
            name: "x".repeat(21),
            wallet_indices: vec![],
        }
        .encode()
        .is_err());
    }

    #[test]
    fn path_validation() {
        let ok = Metadata::from_paths("a", &[format!("{}/4", paths::WALLET_ROOT)]).unwrap();
        assert_eq!(ok.wallet_indices, vec![4]);
        assert_eq!(ok.wallet_paths(), vec![format!("{}/4", paths::WALLET_ROOT)]);

        assert!(Metadata::from_paths("a", &["m/44'/61'/0'/0/1".into()]).is_err());
        assert!(Metadata::from_paths("a", &[format!("{}/x", paths::WALLET_ROOT)]).is_err());
    }
}
