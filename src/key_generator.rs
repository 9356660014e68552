//! Maps integer key indices to cache keys.

use crate::Key;
use eyre::bail;

/// Strategy for turning key indices into [`Key`]s.
///
/// Generation is a pure function of the index, so the same generator can be shared by any number
/// of threads without synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyGenerator {
    /// Produces textual keys of the form `key_<index>`.
    String,
    /// Produces 8-byte big-endian binary keys.
    ByteArray,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::String
    }
}

impl KeyGenerator {
    /// Looks up a generator by its configuration name.
    ///
    /// Errors on unknown names, so that misconfigured runs fail before any thread is started.
    pub fn from_name(name: &str) -> eyre::Result<Self> {
        match name {
            "string" => Ok(Self::String),
            "byte-array" => Ok(Self::ByteArray),
            other => bail!(
                "unknown key generator `{}`. Valid generators are `string` and `byte-array`.",
                other
            ),
        }
    }

    /// Maps the given index to a key.
    ///
    /// Negative indices are valid; they are used for the complement keys of log values.
    pub fn generate_key(&self, index: i64) -> Key {
        match self {
            KeyGenerator::String => Key::Text(format!("key_{}", index)),
            KeyGenerator::ByteArray => Key::Binary(index.to_be_bytes().to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_keys() {
        for generator in [KeyGenerator::String, KeyGenerator::ByteArray] {
            assert_eq!(generator.generate_key(17), generator.generate_key(17));
            assert_ne!(generator.generate_key(17), generator.generate_key(!17));
        }
        assert_eq!(KeyGenerator::String.generate_key(5), Key::from("key_5"));
        assert_eq!(
            KeyGenerator::ByteArray.generate_key(1),
            Key::Binary(vec![0, 0, 0, 0, 0, 0, 0, 1])
        );
    }

    #[test]
    fn unknown_generator() {
        assert_eq!(
            KeyGenerator::from_name("byte-array").unwrap(),
            KeyGenerator::ByteArray
        );
        assert!(KeyGenerator::from_name("uuid").is_err());
    }
}
