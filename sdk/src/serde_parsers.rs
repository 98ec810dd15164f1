use {
    base64::{engine::general_purpose::STANDARD, Engine as _},
    serde::{de::Deserializer, ser::Serializer, Deserialize, Serialize},
};

/// Deserialize a base64 (standard alphabet) string into a `Vec<u8>`.
pub fn deserialize_base64_to_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: String = Deserialize::deserialize(deserializer)?;

    STANDARD.decode(value).map_err(serde::de::Error::custom)
}

/// Inverse of [deserialize_base64_to_bytes].
pub fn serialize_bytes_to_base64<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsRef<[u8]>,
{
    STANDARD.encode(value.as_ref()).serialize(serializer)
}

/// Optional variant of [deserialize_base64_to_bytes]. Pair it with
/// `#[serde(default)]` so that a missing field reads as `None`.
pub fn deserialize_opt_base64_to_bytes<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Deserialize::deserialize(deserializer)?;

    value
        .map(|v| STANDARD.decode(v).map_err(serde::de::Error::custom))
        .transpose()
}

/// Inverse of [deserialize_opt_base64_to_bytes].
pub fn serialize_opt_bytes_to_base64<S>(
    value: &Option<Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    value
        .as_ref()
        .map(|v| STANDARD.encode(v))
        .serialize(serializer)
}

#[cfg(test)]
mod tests {
    use {super::*, serde::Deserialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(
            deserialize_with = "deserialize_base64_to_bytes",
            serialize_with = "serialize_bytes_to_base64"
        )]
        data: Vec<u8>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_opt_base64_to_bytes",
            serialize_with = "serialize_opt_bytes_to_base64"
        )]
        extra: Option<Vec<u8>>,
    }

    #[test]
    fn test_base64_fields() {
        let blob = Blob {
            data: b"hello".to_vec(),
            extra: None,
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"data":"aGVsbG8="}"#);
        assert_eq!(serde_json::from_str::<Blob>(&json).unwrap(), blob);

        let with_extra: Blob = serde_json::from_str(r#"{"data":"","extra":"AQI="}"#).unwrap();
        assert_eq!(with_extra.extra, Some(vec![1, 2]));
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        assert!(serde_json::from_str::<Blob>(r#"{"data":"not base64!"}"#).is_err());
    }
}
