//! Payload serializers.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Format used for handler arguments, responses and pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serializer {
    #[default]
    Json,
    Postcard,
}

impl Serializer {
    pub fn marshal<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes, SerializeError> {
        let bytes = match self {
            Self::Json => serde_json::to_vec(value)?,
            Self::Postcard => postcard::to_stdvec(value)?,
        };
        Ok(Bytes::from(bytes))
    }

    pub fn unmarshal<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, SerializeError> {
        Ok(match self {
            Self::Json => serde_json::from_slice(data)?,
            Self::Postcard => postcard::from_bytes(data)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Join {
        name: String,
        seat: u8,
    }

    #[test]
    fn json_is_plain_text() {
        let bytes = Serializer::Json
            .marshal(&Join {
                name: "ann".into(),
                seat: 2,
            })
            .unwrap();
        assert_eq!(&bytes[..], br#"{"name":"ann","seat":2}"#);
    }

    #[test]
    fn postcard_rejects_json_input() {
        let err = Serializer::Postcard.unmarshal::<Join>(br#"{"name":"ann","seat":2}"#);
        assert!(err.is_err());
    }
}
