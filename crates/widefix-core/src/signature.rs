use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A byte template where `None` marks a wildcard position.
///
/// Signatures are immutable once built and never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ByteSignature {
    bytes: Vec<Option<u8>>,
}

impl ByteSignature {
    /// Parse an interleaved pattern such as `"48 8D 0D ?? ?? ?? ??"`.
    ///
    /// Both `?` and `??` are accepted as wildcards.
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        for token in pattern.split_whitespace() {
            if token == "??" || token == "?" {
                bytes.push(None);
                continue;
            }

            let value = u8::from_str_radix(token, 16).map_err(|e| {
                Error::InvalidSignature(format!("Invalid signature token '{}': {}", token, e))
            })?;
            bytes.push(Some(value));
        }

        Self::from_bytes(bytes)
    }

    /// Build from a code buffer and an `x`/`?` mask of the same length.
    pub fn from_code_mask(code: &[u8], mask: &str) -> Result<Self> {
        if code.len() != mask.len() {
            return Err(Error::InvalidSignature(format!(
                "Pattern length {} does not match mask length {}",
                code.len(),
                mask.len()
            )));
        }

        let bytes = code
            .iter()
            .zip(mask.chars())
            .map(|(&byte, m)| match m {
                'x' | 'X' => Ok(Some(byte)),
                '?' => Ok(None),
                other => Err(Error::InvalidSignature(format!(
                    "Invalid mask character '{}'",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<Option<u8>>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidSignature(
                "Signature pattern is empty".to_string(),
            ));
        }
        Ok(Self { bytes })
    }

    /// Exact-match signature with no wildcards.
    pub fn literal(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes(bytes.iter().copied().map(Some).collect())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[Option<u8>] {
        &self.bytes
    }

    /// First concrete byte and its index, used as the scan anchor.
    pub fn anchor(&self) -> Option<(usize, u8)> {
        self.bytes
            .iter()
            .enumerate()
            .find_map(|(i, b)| b.map(|value| (i, value)))
    }

    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() >= self.bytes.len()
            && self
                .bytes
                .iter()
                .zip(window)
                .all(|(expected, actual)| expected.is_none_or(|value| value == *actual))
    }
}

impl fmt::Display for ByteSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self
            .bytes
            .iter()
            .map(|b| match b {
                Some(value) => format!("{:02X}", value),
                None => "??".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&formatted)
    }
}

impl FromStr for ByteSignature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ByteSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ByteSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::parse(&pattern).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pattern_with_wildcards() {
        let sig = ByteSignature::parse("48 8D 0D ?? ?? ?? ??").unwrap();
        assert_eq!(sig.len(), 7);
        assert_eq!(sig.bytes()[0], Some(0x48));
        assert_eq!(sig.bytes()[1], Some(0x8D));
        assert_eq!(sig.bytes()[2], Some(0x0D));
        assert_eq!(sig.bytes()[3], None);
    }

    #[test]
    fn test_parse_single_question_mark() {
        let sig = ByteSignature::parse("D9 ? 00").unwrap();
        assert_eq!(sig.bytes(), &[Some(0xD9), None, Some(0x00)]);
    }

    #[test]
    fn test_parse_rejects_empty_and_garbage() {
        assert!(ByteSignature::parse("").is_err());
        assert!(ByteSignature::parse("   ").is_err());
        assert!(ByteSignature::parse("48 GG").is_err());
    }

    #[test]
    fn test_code_mask_keeps_embedded_zeros() {
        let sig = ByteSignature::from_code_mask(b"\xD9\x05\x00\x00\x00\x00\x00", "xx????x").unwrap();
        assert_eq!(sig.to_string(), "D9 05 ?? ?? ?? ?? 00");
    }

    #[test]
    fn test_code_mask_length_mismatch() {
        let err = ByteSignature::from_code_mask(b"\x90\x90", "x").unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(_)));
    }

    #[test]
    fn test_anchor_skips_leading_wildcards() {
        let sig = ByteSignature::parse("?? ?? C7 05").unwrap();
        assert_eq!(sig.anchor(), Some((2, 0xC7)));

        let all_wild = ByteSignature::parse("?? ??").unwrap();
        assert_eq!(all_wild.anchor(), None);
    }

    #[test]
    fn test_serde_uses_pattern_string() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            pattern: ByteSignature,
        }

        let holder: Holder = toml::from_str(r#"pattern = "D9 05 ?? ?? ?? ??""#).unwrap();
        assert_eq!(holder.pattern.len(), 6);
        let text = toml::to_string(&holder).unwrap();
        assert!(text.contains("D9 05 ?? ?? ?? ??"));
    }
}
