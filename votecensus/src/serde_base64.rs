//! Byte fields rendered as standard base64 strings in JSON.
//!
//! Use with `#[serde(with = "serde_base64")]`, or `serde_base64::option` for optional fields.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(bytes))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

pub mod option {
    use super::*;

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) if !encoded.is_empty() => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Record {
        #[serde(with = "crate::serde_base64")]
        data: Vec<u8>,
        #[serde(default, with = "crate::serde_base64::option")]
        extra: Option<Vec<u8>>,
    }

    #[test]
    fn json_fields() {
        let record = Record {
            data: vec![0xff, 0x00, 0x01],
            extra: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"data":"/wAB","extra":null}"#);
        assert_eq!(serde_json::from_str::<Record>(&json).unwrap(), record);

        let parsed: Record = serde_json::from_str(r#"{"data":"","extra":"Y2FmZQ=="}"#).unwrap();
        assert!(parsed.data.is_empty());
        assert_eq!(parsed.extra, Some(b"cafe".to_vec()));

        assert!(serde_json::from_str::<Record>(r#"{"data":"not base64!"}"#).is_err());
    }
}
