use {crate::crypto::EngineError, thiserror::Error};

/// Every failure a session or the session manager can surface.
///
/// The variants are cheap to clone so that a session which failed to
/// initialise can keep reporting the original cause on every later call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    /// Local or peer key bytes could not be loaded into the engine's
    /// representation. Usually corrupted key material or a malformed card.
    #[error("key conversion failed: {0}")]
    KeyConversion(String),
    /// The engine refused to derive a session from well-formed inputs.
    #[error("session derivation failed: {0}")]
    SessionDerivation(String),
    /// A handshake or card signature did not verify. Never downgraded to an
    /// unauthenticated session.
    #[error("signature verification failed")]
    SignatureVerificationFailed,
    /// A referenced local key is missing from the key pool.
    #[error("key not found: {0}")]
    KeyNotFound(String),
    /// The session has not been initialised yet (e.g. decrypt before the
    /// handshake was processed).
    #[error("session is not initialized")]
    NotInitialized,
    /// A session that failed to initialise was used again.
    #[error("session failed to initialize and must be discarded: {0}")]
    SessionFailed(String),
    /// Text or bytes could not be represented on the wire.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// An inbound envelope could not be parsed.
    #[error("decoding error: {0}")]
    Decoding(String),
    /// The engine rejected an encryption or decryption.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),
    /// The envelope belongs to a different session or card.
    #[error("session mismatch: {0}")]
    SessionMismatch(String),
    /// The identity card published in the directory does not match the local
    /// identity key.
    #[error("published identity card {0} does not match the local identity key")]
    IdentityMismatch(String),
    /// The card directory failed. Retrying is up to the directory client.
    #[error("directory error: {0}")]
    Directory(String),
    /// The session store failed to read or write a record.
    #[error("session store error: {0}")]
    Store(String),
    /// Configuration could not be loaded or saved.
    #[error("configuration error: {0}")]
    Conf(String),
    /// The manager was shut down while the call was in flight.
    #[error("session manager has been shut down")]
    ManagerClosed,
}

/// Result type used across the crate.
pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    /// Convert a directory collaborator failure.
    pub fn directory(e: anyhow::Error) -> Self {
        Self::Directory(format!("{e:#}"))
    }
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidKey(_) => Self::KeyConversion(e.to_string()),
            EngineError::HkdfInvalidLength | EngineError::Derivation(_) => {
                Self::SessionDerivation(e.to_string())
            }
            EngineError::Aead | EngineError::DecryptFailed | EngineError::CiphertextTooLarge => {
                Self::CryptoFailure(e.to_string())
            }
            EngineError::InvalidHandle => Self::Store(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_taxonomy() {
        assert_eq!(
            SessionError::from(EngineError::InvalidKey("peer long-term".into())),
            SessionError::KeyConversion("invalid key: peer long-term".into())
        );
        assert!(matches!(
            SessionError::from(EngineError::HkdfInvalidLength),
            SessionError::SessionDerivation(_)
        ));
        assert!(matches!(
            SessionError::from(EngineError::DecryptFailed),
            SessionError::CryptoFailure(_)
        ));
    }

    #[test]
    fn directory_error_keeps_context() {
        let err = anyhow::anyhow!("connection refused").context("Failed to fetch card");
        assert_eq!(
            SessionError::directory(err),
            SessionError::Directory("Failed to fetch card: connection refused".into())
        );
    }
}
