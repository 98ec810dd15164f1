//! Wire format of session messages.
//!
//! The first message of a session is a self-contained handshake object:
//!
//! ```json
//! {
//!   "initiator_card_id": "..",
//!   "responder_card_id": "..",
//!   "responder_lt_card_id": "..",
//!   "responder_ot_card_id": "..",
//!   "eph_public_key": "<base64>",
//!   "eph_public_key_signature": "<base64>",
//!   "salt": "<base64>",
//!   "ciphertext": "<base64>"
//! }
//! ```
//!
//! `responder_ot_card_id` is omitted when the responder had no one-time card.
//! Every later message is `{"session_id": "<hex>", "salt": .., "ciphertext": ..}`.

use {
    crate::{
        cards::CardId,
        error::{SessionError, SessionResult},
        serde_parsers::{deserialize_base64_to_bytes, serialize_bytes_to_base64},
        state::SessionId,
    },
    serde::{Deserialize, Serialize},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandshakeMessage {
    pub initiator_card_id: CardId,
    pub responder_card_id: CardId,
    pub responder_lt_card_id: CardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_ot_card_id: Option<CardId>,
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub eph_public_key: Vec<u8>,
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub eph_public_key_signature: Vec<u8>,
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub salt: Vec<u8>,
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegularMessage {
    pub session_id: SessionId,
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub salt: Vec<u8>,
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub ciphertext: Vec<u8>,
}

/// Any message a session can receive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Handshake(HandshakeMessage),
    Regular(RegularMessage),
}

impl Envelope {
    pub fn parse(raw: &str) -> SessionResult<Self> {
        serde_json::from_str(raw)
            .map_err(|_| SessionError::Decoding("envelope is neither a handshake nor a message".into()))
    }

    pub fn to_wire(&self) -> SessionResult<String> {
        serde_json::to_string(self).map_err(|e| SessionError::Encoding(e.to_string()))
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Envelope::Handshake(_))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    fn handshake(ot: Option<&str>) -> HandshakeMessage {
        HandshakeMessage {
            initiator_card_id: CardId::from("alice"),
            responder_card_id: CardId::from("bob"),
            responder_lt_card_id: CardId::from("bob-lt"),
            responder_ot_card_id: ot.map(CardId::from),
            eph_public_key: vec![1; 32],
            eph_public_key_signature: vec![2; 64],
            salt: vec![3; 32],
            ciphertext: vec![4; 21],
        }
    }

    #[test]
    fn test_handshake_field_names() {
        let wire = Envelope::Handshake(handshake(Some("bob-ot"))).to_wire().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        let mut keys = value.as_object().unwrap().keys().cloned().collect::<Vec<_>>();
        keys.sort();

        assert_eq!(
            keys,
            vec![
                "ciphertext",
                "eph_public_key",
                "eph_public_key_signature",
                "initiator_card_id",
                "responder_card_id",
                "responder_lt_card_id",
                "responder_ot_card_id",
                "salt",
            ]
        );
    }

    #[test]
    fn test_handshake_without_one_time_card() {
        let wire = Envelope::Handshake(handshake(None)).to_wire().unwrap();
        assert!(!wire.contains("responder_ot_card_id"));
        assert_eq!(Envelope::parse(&wire).unwrap(), Envelope::Handshake(handshake(None)));
    }

    #[test]
    fn test_regular_message_is_not_a_handshake() {
        let msg = RegularMessage {
            session_id: SessionId([5; 32]),
            salt: vec![6; 32],
            ciphertext: vec![7; 17],
        };
        let wire = Envelope::Regular(msg.clone()).to_wire().unwrap();
        let parsed = Envelope::parse(&wire).unwrap();

        assert!(!parsed.is_handshake());
        assert_eq!(parsed, Envelope::Regular(msg));
    }

    #[test]
    fn test_malformed_envelopes() {
        assert_matches!(Envelope::parse("hello"), Err(SessionError::Decoding(_)));
        assert_matches!(
            Envelope::parse(r#"{"session_id":"00","salt":"","ciphertext":""}"#),
            Err(SessionError::Decoding(_))
        );
        assert_matches!(
            Envelope::parse(r#"{"initiator_card_id":"alice","salt":"AA==","ciphertext":"AA=="}"#),
            Err(SessionError::Decoding(_))
        );
    }
}
