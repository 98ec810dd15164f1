//! Boundary between session orchestration and the cryptographic primitives.
//!
//! Sessions never touch curve points or AEAD ciphers directly. They hand raw
//! key bytes (as stored in the [`LocalKeyPool`](crate::key_pool::LocalKeyPool)
//! or published on [`Card`](crate::cards::Card)s) to a [`CryptoEngine`], which
//! converts them into its own key types, derives sessions and seals messages.
//!
//! [`X3dhEngine`] is the default engine: X25519 key agreement in the X3DH
//! pattern, XEdDSA signatures and salted XChaCha20-Poly1305 message sealing.

pub mod secret_bytes;
pub mod x3dh;

pub use x3dh::X3dhEngine;
use {crate::state::SessionId, thiserror::Error, zeroize::Zeroizing};

/// Failures reported by a [`CryptoEngine`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Key bytes have the wrong length or encode an unusable point.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// Internal HKDF error (should be unreachable under sane parameters).
    #[error("HKDF output length is wrong")]
    HkdfInvalidLength,
    /// Key agreement produced an unusable shared secret.
    #[error("derivation rejected: {0}")]
    Derivation(String),
    /// Authenticated encryption error.
    #[error("AEAD error")]
    Aead,
    /// Authenticated decryption failed (ciphertext corrupt or wrong key).
    #[error("decryption failed")]
    DecryptFailed,
    /// Ciphertext length exceeded the engine's limit.
    #[error("ciphertext too large")]
    CiphertextTooLarge,
    /// A persisted session snapshot could not be imported.
    #[error("invalid session handle")]
    InvalidHandle,
}

impl From<hkdf::InvalidLength> for EngineError {
    fn from(_: hkdf::InvalidLength) -> Self {
        Self::HkdfInvalidLength
    }
}

/// Freshly generated key pair in raw byte form.
pub struct RawKeyPair {
    pub private_key: Zeroizing<Vec<u8>>,
    pub public_key: Vec<u8>,
}

/// Private inputs of the party that starts the conversation.
pub struct InitiatorPrivateInfo<K> {
    pub identity_key: K,
    pub ephemeral_key: K,
}

/// Published keys of the party being contacted. `one_time_key` is absent when
/// the peer had no one-time card left.
pub struct ResponderPublicInfo<P> {
    pub identity_key: P,
    pub long_term_key: P,
    pub one_time_key: Option<P>,
}

/// Private inputs of the party answering a handshake.
pub struct ResponderPrivateInfo<K> {
    pub identity_key: K,
    pub long_term_key: K,
    pub one_time_key: Option<K>,
}

/// Public inputs the responder learns from the handshake.
pub struct InitiatorPublicInfo<P> {
    pub identity_key: P,
    pub ephemeral_key: P,
}

/// Outcome of a successful derivation.
pub struct DerivedSession<H> {
    pub session_id: SessionId,
    pub handle: H,
}

/// A sealed message: the per-message salt and the authenticated ciphertext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sealed {
    pub salt: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Forward-secret key agreement and message sealing.
///
/// Implementations must be deterministic in their derivations: both parties
/// feeding matching inputs derive the same [`SessionId`] and compatible
/// handles.
pub trait CryptoEngine: Send + Sync + 'static {
    type PrivateKey: Send + Sync;
    type PublicKey: Send + Sync;
    /// Opaque derived session secrets.
    type Handle: Send + Sync;

    /// Generate a key pair for identity, long-term, one-time or ephemeral use.
    fn generate_key_pair(&self) -> RawKeyPair;

    fn import_private_key(&self, raw: &[u8]) -> Result<Self::PrivateKey, EngineError>;

    fn import_public_key(&self, raw: &[u8]) -> Result<Self::PublicKey, EngineError>;

    /// Raw public key matching `key`.
    fn public_key_bytes(&self, key: &Self::PrivateKey) -> Vec<u8>;

    fn derive_initiator_session(
        &self,
        local: &InitiatorPrivateInfo<Self::PrivateKey>,
        peer: &ResponderPublicInfo<Self::PublicKey>,
        additional_data: &[u8],
    ) -> Result<DerivedSession<Self::Handle>, EngineError>;

    fn derive_responder_session(
        &self,
        local: &ResponderPrivateInfo<Self::PrivateKey>,
        peer: &InitiatorPublicInfo<Self::PublicKey>,
        additional_data: &[u8],
    ) -> Result<DerivedSession<Self::Handle>, EngineError>;

    fn encrypt_with(&self, handle: &Self::Handle, plaintext: &[u8])
        -> Result<Sealed, EngineError>;

    fn decrypt_with(
        &self,
        handle: &Self::Handle,
        salt: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, EngineError>;

    fn sign(&self, data: &[u8], key: &Self::PrivateKey) -> Vec<u8>;

    fn verify(&self, data: &[u8], signature: &[u8], key: &Self::PublicKey) -> bool;

    /// Serialise a handle so the session can be rehydrated after a restart.
    fn export_handle(&self, handle: &Self::Handle) -> Zeroizing<Vec<u8>>;

    fn import_handle(&self, raw: &[u8]) -> Result<Self::Handle, EngineError>;
}
