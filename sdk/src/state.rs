//! Persisted session bookkeeping.
//!
//! A [`SessionState`] holds everything needed to rebuild an initialized
//! session after a restart without deriving again or calling the directory:
//! the [`SecureSessionIdentity`], the card references that were used in the
//! handshake ([`PeerKeys`]) and an engine-exported snapshot of the derived
//! secret.

use {
    crate::{
        cards::CardId,
        serde_parsers::{
            deserialize_base64_to_bytes,
            deserialize_opt_base64_to_bytes,
            serialize_bytes_to_base64,
            serialize_opt_bytes_to_base64,
        },
    },
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::{fmt, str::FromStr},
};

/// Identifier assigned by the engine when a session is derived. Both parties
/// of a session compute the same value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 32]);

impl SessionId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

impl FromStr for SessionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("session id is not hex: {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("session id must be 32 bytes, got {}", b.len()))?;

        Ok(Self(bytes))
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value: String = Deserialize::deserialize(deserializer)?;

        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Which side of the handshake this party played.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Identity of an initialized session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureSessionIdentity {
    pub role: Role,
    /// Identity card id of the other party.
    pub peer_card_id: CardId,
    pub session_id: SessionId,
    /// Name of the ephemeral key the initiator derived with. The private key
    /// itself is discarded after derivation. Responders never hold one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_key_name: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub expiration_date: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_opt_base64_to_bytes",
        serialize_with = "serialize_opt_bytes_to_base64"
    )]
    pub additional_data: Option<Vec<u8>>,
}

impl SecureSessionIdentity {
    /// Expiry is checked by the manager at lookup time only.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date <= now
    }
}

/// Card references a session was derived from.
///
/// The long-term and one-time cards always belong to the responder of the
/// handshake. For an initiator they are the peer's published cards, for a
/// responder they name its own pool keys that the handshake consumed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKeys {
    pub identity_card_id: CardId,
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub identity_public_key: Vec<u8>,
    pub long_term_card_id: CardId,
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub long_term_public_key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_card_id: Option<CardId>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_opt_base64_to_bytes",
        serialize_with = "serialize_opt_bytes_to_base64"
    )]
    pub one_time_public_key: Option<Vec<u8>>,
    /// Initiator ephemeral public key carried by the handshake.
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub ephemeral_public_key: Vec<u8>,
}

/// Persisted record for one peer. Saving a new state for the same peer
/// supersedes the previous one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(flatten)]
    pub identity: SecureSessionIdentity,
    pub peer: PeerKeys,
    /// Engine-exported snapshot of the derived session secret.
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub session_secret: Vec<u8>,
}

impl SessionState {
    pub fn peer_card_id(&self) -> &CardId {
        &self.identity.peer_card_id
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("identity", &self.identity)
            .field("peer", &self.peer)
            .field("session_secret", &"<redacted>")
            .finish()
    }
}
