//! Published key cards.
//!
//! Every party publishes an identity card plus rotating long-term and
//! one-time cards. Pre-key cards are signed by the owner's identity key so an
//! initiator can tell they were not substituted by the directory.

use {
    crate::{
        crypto::CryptoEngine,
        error::{SessionError, SessionResult},
        serde_parsers::{
            deserialize_base64_to_bytes,
            deserialize_opt_base64_to_bytes,
            serialize_bytes_to_base64,
            serialize_opt_bytes_to_base64,
        },
    },
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::fmt,
};

/// Opaque card identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(String);

impl CardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of a freshly generated card: hex encoded SHA-256 of its public key.
    pub fn for_public_key(public_key: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(public_key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CardId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CardId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Identity,
    LongTerm,
    OneTime,
}

/// A published public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub kind: CardKind,
    /// Identity card id of the owner. Identity cards own themselves.
    pub owner: CardId,
    #[serde(
        deserialize_with = "deserialize_base64_to_bytes",
        serialize_with = "serialize_bytes_to_base64"
    )]
    pub public_key: Vec<u8>,
    /// Owner's identity-key signature over `public_key`. Absent on identity
    /// cards.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_opt_base64_to_bytes",
        serialize_with = "serialize_opt_bytes_to_base64"
    )]
    pub signature: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl Card {
    /// Build an identity card for `public_key`.
    pub fn identity(public_key: Vec<u8>) -> Self {
        let id = CardId::for_public_key(&public_key);

        Self {
            owner: id.clone(),
            id,
            kind: CardKind::Identity,
            public_key,
            signature: None,
            created_at: Utc::now(),
        }
    }

    /// Build a long-term or one-time card signed by the owner's identity key.
    pub fn signed(kind: CardKind, owner: CardId, public_key: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            id: CardId::for_public_key(&public_key),
            kind,
            owner,
            public_key,
            signature: Some(signature),
            created_at: Utc::now(),
        }
    }

    /// Check the card signature against the owner's identity public key.
    pub fn verify_signature<E: CryptoEngine>(
        &self,
        engine: &E,
        owner_key: &E::PublicKey,
    ) -> bool {
        self.signature
            .as_deref()
            .is_some_and(|sig| engine.verify(&self.public_key, sig, owner_key))
    }
}

/// A peer's published cards, as resolved by the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCardSet {
    pub identity_card: Card,
    pub long_term_card: Card,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_card: Option<Card>,
}

impl KeyCardSet {
    pub fn identity_id(&self) -> &CardId {
        &self.identity_card.id
    }

    /// Verify that the pre-key cards belong to the identity card and carry a
    /// valid signature from it.
    pub fn verify<E: CryptoEngine>(&self, engine: &E) -> SessionResult<()> {
        let identity_key = engine.import_public_key(&self.identity_card.public_key)?;

        let pre_keys = std::iter::once(&self.long_term_card).chain(self.one_time_card.as_ref());
        for card in pre_keys {
            if card.owner != self.identity_card.id {
                log::error!(
                    "[cards] Card {} is owned by {}, not by {}",
                    card.id,
                    card.owner,
                    self.identity_card.id
                );

                return Err(SessionError::SignatureVerificationFailed);
            }

            if !card.verify_signature(engine, &identity_key) {
                log::error!(
                    "[cards] Signature of {:?} card {} does not verify against {}",
                    card.kind,
                    card.id,
                    self.identity_card.id
                );

                return Err(SessionError::SignatureVerificationFailed);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::crypto::{CryptoEngine, X3dhEngine},
    };

    fn card_set(engine: &X3dhEngine, with_one_time: bool) -> KeyCardSet {
        let identity = engine.generate_key_pair();
        let identity_sk = engine.import_private_key(&identity.private_key).unwrap();
        let identity_card = Card::identity(identity.public_key.clone());

        let signed = |kind| {
            let pair = engine.generate_key_pair();
            let sig = engine.sign(&pair.public_key, &identity_sk);
            Card::signed(kind, identity_card.id.clone(), pair.public_key, sig)
        };

        KeyCardSet {
            long_term_card: signed(CardKind::LongTerm),
            one_time_card: with_one_time.then(|| signed(CardKind::OneTime)),
            identity_card,
        }
    }

    #[test]
    fn test_card_id_is_hash_of_key() {
        let id = CardId::for_public_key(b"key");
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id, CardId::for_public_key(b"key"));
        assert_ne!(id, CardId::for_public_key(b"other key"));
    }

    #[test]
    fn test_valid_card_set_verifies() {
        let engine = X3dhEngine::new();
        assert_eq!(card_set(&engine, true).verify(&engine), Ok(()));
        assert_eq!(card_set(&engine, false).verify(&engine), Ok(()));
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let engine = X3dhEngine::new();
        let mut set = card_set(&engine, true);
        if let Some(card) = set.one_time_card.as_mut() {
            card.signature.as_mut().unwrap()[0] ^= 0x01;
        }
        assert_eq!(
            set.verify(&engine),
            Err(SessionError::SignatureVerificationFailed)
        );
    }

    #[test]
    fn test_unsigned_or_foreign_card_is_rejected() {
        let engine = X3dhEngine::new();
        let mut set = card_set(&engine, false);
        set.long_term_card.signature = None;
        assert_eq!(
            set.verify(&engine),
            Err(SessionError::SignatureVerificationFailed)
        );

        let mut set = card_set(&engine, false);
        set.long_term_card.owner = CardId::from("someone-else");
        assert_eq!(
            set.verify(&engine),
            Err(SessionError::SignatureVerificationFailed)
        );
    }

    #[test]
    fn test_card_json_shape() {
        let engine = X3dhEngine::new();
        let set = card_set(&engine, false);
        let value = serde_json::to_value(&set).unwrap();
        assert_eq!(value["long_term_card"]["kind"], "long_term");
        assert!(value.get("one_time_card").is_none());
        assert!(value["identity_card"].get("signature").is_none());
        assert_eq!(serde_json::from_value::<KeyCardSet>(value).unwrap(), set);
    }
}
