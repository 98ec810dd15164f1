//! Forward-secret messaging sessions between parties identified by published
//! key cards.
//!
//! Each party publishes an identity card plus rotating long-term and one-time
//! pre-key cards. An initiator consumes a peer's published [`cards::KeyCardSet`]
//! to derive a session and embeds a handshake into its first message; the
//! responder derives the same session from that handshake and its local key
//! pool. Sessions persist through a [`store::SessionStore`] and are recovered
//! after a restart without deriving again.

/// Published identity, long-term and one-time cards.
pub mod cards;
/// Session manager configuration, stored as TOML.
pub mod conf;
/// The explicitly passed per-process session context.
pub mod context;
/// Key agreement, signing and message sealing behind the [`crypto::CryptoEngine`]
/// trait, with an X3DH based default engine.
pub mod crypto;
/// The external card directory and its HTTP client.
pub mod directory;
mod error;
/// Private pre-keys of this party.
pub mod key_pool;
pub mod manager;
mod serde_parsers;
/// Initiator and responder sessions and their wire format.
pub mod session;
/// Persisted session records.
pub mod state;
/// Session record stores.
pub mod store;

pub use {
    error::{SessionError, SessionResult},
    manager::SessionManager,
    session::{ActiveSession, SecureSession, SessionPhase},
};
