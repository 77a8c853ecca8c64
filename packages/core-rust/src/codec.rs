//! Body codecs selected by an envelope's content type.
//!
//! JSON is the default and what every existing caller speaks. `MsgPack`
//! is encoded with named fields (`rmp_serde::to_vec_named`) so struct
//! payloads stay self-describing on the wire.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Content-type header value for JSON bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content-type header value for `MsgPack` bodies.
pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// Serialized representation of `null` for each codec, used for empty bodies.
const JSON_NULL: &[u8] = b"null";
const MSGPACK_NIL: &[u8] = &[0xc0];

/// Serialization format of an envelope body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentType {
    /// `application/json`.
    #[default]
    Json,
    /// `application/msgpack`.
    MsgPack,
}

/// Errors from encoding or decoding an envelope body.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl ContentType {
    /// Returns the header value carried on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => JSON_CONTENT_TYPE,
            Self::MsgPack => MSGPACK_CONTENT_TYPE,
        }
    }

    /// Parses a content-type header. Anything unrecognised is treated as JSON.
    #[must_use]
    pub fn from_header(value: &str) -> Self {
        let essence = value.split(';').next().unwrap_or_default().trim();
        if essence.eq_ignore_ascii_case(MSGPACK_CONTENT_TYPE)
            || essence.eq_ignore_ascii_case("application/x-msgpack")
        {
            Self::MsgPack
        } else {
            Self::Json
        }
    }

    /// Serializes `value` into a body.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` if the value cannot be represented in this format.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(value)?),
            Self::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    /// Deserializes a body. An empty body decodes as `null`, so `()` and
    /// `Option<T>` responses work with handlers that reply with nothing.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` if the body is malformed or does not match `T`.
    pub fn decode<T: DeserializeOwned>(self, body: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => {
                let body = if body.is_empty() { JSON_NULL } else { body };
                Ok(serde_json::from_slice(body)?)
            }
            Self::MsgPack => {
                let body = if body.is_empty() { MSGPACK_NIL } else { body };
                Ok(rmp_serde::from_slice(body)?)
            }
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wallet {
        id: String,
        balance: i64,
    }

    #[test]
    fn header_parsing_defaults_to_json() {
        assert_eq!(ContentType::from_header("application/json"), ContentType::Json);
        assert_eq!(
            ContentType::from_header("application/json; charset=utf-8"),
            ContentType::Json
        );
        assert_eq!(ContentType::from_header(""), ContentType::Json);
        assert_eq!(ContentType::from_header("text/plain"), ContentType::Json);
        assert_eq!(
            ContentType::from_header("Application/MsgPack"),
            ContentType::MsgPack
        );
        assert_eq!(
            ContentType::from_header("application/x-msgpack"),
            ContentType::MsgPack
        );
    }

    #[test]
    fn empty_body_decodes_as_null() {
        let _unit: () = ContentType::Json.decode(b"").unwrap();
        let none: Option<Wallet> = ContentType::MsgPack.decode(b"").unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn empty_body_is_an_error_for_structs() {
        let result: Result<Wallet, _> = ContentType::Json.decode(b"");
        assert!(matches!(result, Err(CodecError::Json(_))));
    }

    #[test]
    fn json_body_matches_wire_text() {
        let body = ContentType::Json
            .encode(&Wallet {
                id: "w1".to_string(),
                balance: 100,
            })
            .unwrap();
        assert_eq!(body, br#"{"id":"w1","balance":100}"#);
    }

    #[test]
    fn msgpack_uses_named_fields() {
        let body = ContentType::MsgPack
            .encode(&Wallet {
                id: "w1".to_string(),
                balance: 100,
            })
            .unwrap();
        // fixmap with two entries, keyed by field name
        assert_eq!(body[0], 0x82);
        let decoded: Wallet = ContentType::MsgPack.decode(&body).unwrap();
        assert_eq!(decoded.id, "w1");
    }

    #[test]
    fn malformed_msgpack_is_decode_error() {
        let result: Result<Wallet, _> = ContentType::MsgPack.decode(&[0xc1]);
        assert!(matches!(result, Err(CodecError::MsgPackDecode(_))));
    }
}
