use std::fmt;

/// Applet version as reported by SELECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether the applet supports the extended-key export variant.
    /// The threshold is (3, 1) compared lexicographically, so 4.0
    /// qualifies as well.
    pub fn supports_extended_keys(self) -> bool {
        (self.major, self.minor) >= (3, 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_key_threshold_is_lexicographic() {
        assert!(!Version::new(2, 2).supports_extended_keys());
        assert!(!Version::new(3, 0).supports_extended_keys());
        assert!(Version::new(3, 1).supports_extended_keys());
        assert!(Version::new(3, 2).supports_extended_keys());
        assert!(Version::new(4, 0).supports_extended_keys());
    }
}
