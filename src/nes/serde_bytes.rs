//! Base64 encodings for the byte arrays carried in save states.
//!
//! `serde` only derives arrays up to 32 elements, and RAM images are far
//! more compact as a single string than as a JSON number list.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

fn decode<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    BASE64_STANDARD
        .decode(text.as_bytes())
        .map_err(|err| D::Error::custom(format!("invalid base64 payload: {err}")))
}

/// Fixed-size arrays such as `[u8; 2048]`.
pub mod array {
    use super::{BASE64_STANDARD, Deserializer, Engine, Serializer, decode};
    use serde::de::Error as _;

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let bytes = decode(deserializer)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {N} bytes, found {len}")))
    }
}

/// Growable buffers (CHR RAM, PRG RAM).
pub mod vec {
    use super::{BASE64_STANDARD, Deserializer, Engine, Serializer, decode};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        decode(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "super::array")]
        fixed: [u8; 40],
        #[serde(with = "super::vec")]
        growable: Vec<u8>,
    }

    #[test]
    fn arrays_survive_json() {
        let mut fixed = [0u8; 40];
        fixed[39] = 0xA5;
        let blob = Blob {
            fixed,
            growable: vec![1, 2, 3],
        };

        let text = serde_json::to_string(&blob).unwrap();
        assert!(text.contains("\"growable\":\"AQID\""));
        let back: Blob = serde_json::from_str(&text).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn wrong_array_length_is_rejected() {
        let text = r#"{"fixed":"AQID","growable":""}"#;
        assert!(serde_json::from_str::<Blob>(text).is_err());
    }
}
