use serde::{Deserialize, Serialize};

/// Pairing record for one card instance: the 32-byte pairing master key
/// derived at PAIR time and the slot index the card allocated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingInfo {
    /// Pairing master key
    #[serde(with = "hex_key")]
    pub key: [u8; 32],
    /// Pairing slot index
    pub index: u8,
}

impl PairingInfo {
    pub const fn new(key: [u8; 32], index: u8) -> Self {
        Self { key, index }
    }
}

impl std::fmt::Debug for PairingInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The pairing key grants secure-channel access; keep it out of logs.
        f.debug_struct("PairingInfo")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

mod hex_key {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(&raw).map_err(de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| de::Error::custom("pairing key must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_key_as_hex() {
        let info = PairingInfo::new([0xAB; 32], 3);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["index"], 3);
        assert_eq!(json["key"], "ab".repeat(32));

        let back: PairingInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn rejects_short_key() {
        let err = serde_json::from_str::<PairingInfo>(r#"{"index":0,"key":"abcd"}"#);
        assert!(err.is_err());
    }
}
