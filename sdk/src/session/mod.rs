//! Session state machine.
//!
//! A session starts [`SessionPhase::Uninitialized`] and moves exactly once to
//! either [`SessionPhase::Initialized`] or the terminal
//! [`SessionPhase::Failed`]. The transition runs behind a one-shot latch, so
//! concurrent callers never initialize twice: the first one runs the
//! protocol, everyone else waits for its outcome.
//!
//! [`InitiatorSession`] derives from a peer's published [`KeyCardSet`] and
//! embeds a handshake into its first message. [`ResponderSession`] derives
//! from that handshake and the local key pool. [`ActiveSession`] is the
//! two-variant wrapper the manager hands out.
//!
//! [`KeyCardSet`]: crate::cards::KeyCardSet

mod envelope;
mod initiator;
mod responder;

pub use {envelope::*, initiator::InitiatorSession, responder::ResponderSession};
use {
    crate::{
        cards::CardId,
        context::SessionContext,
        crypto::CryptoEngine,
        error::{SessionError, SessionResult},
        state::{PeerKeys, Role, SecureSessionIdentity, SessionId, SessionState},
    },
    chrono::{DateTime, Utc},
    std::{fmt, sync::OnceLock},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Initialized,
    Failed,
}

/// Behaviour shared by both session roles.
pub trait SecureSession: Send + Sync {
    fn role(&self) -> Role;

    /// Identity card id of the other party.
    fn peer_card_id(&self) -> &CardId;

    fn phase(&self) -> SessionPhase;

    /// Available once the session is initialized.
    fn identity(&self) -> Option<&SecureSessionIdentity>;

    /// Run the initialization protocol if it has not run yet.
    fn initialize(&self) -> SessionResult<()>;

    /// Encrypt `plaintext` into a wire envelope, initializing first if needed.
    fn encrypt(&self, plaintext: &str) -> SessionResult<String>;

    fn decrypt(&self, envelope: &str) -> SessionResult<String>;

    fn session_id(&self) -> Option<SessionId> {
        self.identity().map(|identity| identity.session_id)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.identity().is_some_and(|identity| identity.is_expired(now))
    }
}

/// Derived secrets plus the bookkeeping they were derived from.
pub(crate) struct Established<H> {
    pub(crate) identity: SecureSessionIdentity,
    pub(crate) peer: PeerKeys,
    pub(crate) handle: H,
}

impl<H> Established<H> {
    /// Rehydrate from a persisted record without deriving.
    pub(crate) fn recover<E>(engine: &E, state: SessionState, role: Role) -> SessionResult<Self>
    where
        E: CryptoEngine<Handle = H>,
    {
        if state.identity.role != role {
            return Err(SessionError::SessionMismatch(format!(
                "stored session for {} is a {} session",
                state.identity.peer_card_id, state.identity.role
            )));
        }

        let handle = engine.import_handle(&state.session_secret)?;

        Ok(Self {
            identity: state.identity,
            peer: state.peer,
            handle,
        })
    }

    pub(crate) fn to_state<E>(&self, engine: &E) -> SessionState
    where
        E: CryptoEngine<Handle = H>,
    {
        SessionState {
            identity: self.identity.clone(),
            peer: self.peer.clone(),
            session_secret: engine.export_handle(&self.handle).to_vec(),
        }
    }
}

/// One-shot initialization guard.
pub(crate) struct InitLatch<H> {
    cell: OnceLock<SessionResult<Established<H>>>,
}

impl<H> InitLatch<H> {
    pub(crate) fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// A latch that already holds the outcome of an eager initialization.
    pub(crate) fn settled(outcome: SessionResult<Established<H>>) -> Self {
        Self {
            cell: OnceLock::from(outcome),
        }
    }

    pub(crate) fn phase(&self) -> SessionPhase {
        match self.cell.get() {
            None => SessionPhase::Uninitialized,
            Some(Ok(_)) => SessionPhase::Initialized,
            Some(Err(_)) => SessionPhase::Failed,
        }
    }

    /// The established session, without initializing.
    pub(crate) fn get(&self) -> SessionResult<&Established<H>> {
        match self.cell.get() {
            None => Err(SessionError::NotInitialized),
            Some(Ok(established)) => Ok(established),
            Some(Err(e)) => Err(SessionError::SessionFailed(e.to_string())),
        }
    }

    /// Run `init` unless the latch is already settled. The caller whose `init`
    /// failed gets the original error; later callers get
    /// [`SessionError::SessionFailed`].
    pub(crate) fn get_or_init(
        &self,
        init: impl FnOnce() -> SessionResult<Established<H>>,
    ) -> SessionResult<&Established<H>> {
        let mut ran = false;

        let outcome = self.cell.get_or_init(|| {
            ran = true;
            init()
        });

        match outcome {
            Ok(established) => Ok(established),
            Err(e) if ran => Err(e.clone()),
            Err(e) => Err(SessionError::SessionFailed(e.to_string())),
        }
    }

    pub(crate) fn identity(&self) -> Option<&SecureSessionIdentity> {
        match self.cell.get() {
            Some(Ok(established)) => Some(&established.identity),
            _ => None,
        }
    }
}

/// Seal `plaintext` into a regular envelope.
pub(crate) fn seal<E: CryptoEngine>(
    ctx: &SessionContext<E>,
    established: &Established<E::Handle>,
    plaintext: &str,
) -> SessionResult<String> {
    let sealed = ctx
        .engine()
        .encrypt_with(&established.handle, plaintext.as_bytes())?;

    Envelope::Regular(RegularMessage {
        session_id: established.identity.session_id,
        salt: sealed.salt,
        ciphertext: sealed.ciphertext,
    })
    .to_wire()
}

/// Open `salt`/`ciphertext` with the session secrets.
pub(crate) fn open<E: CryptoEngine>(
    ctx: &SessionContext<E>,
    established: &Established<E::Handle>,
    salt: &[u8],
    ciphertext: &[u8],
) -> SessionResult<String> {
    let plaintext = ctx
        .engine()
        .decrypt_with(&established.handle, salt, ciphertext)?;

    String::from_utf8(plaintext)
        .map_err(|_| SessionError::Decoding("plaintext is not valid UTF-8".into()))
}

/// Open a regular envelope addressed to this session.
pub(crate) fn open_regular<E: CryptoEngine>(
    ctx: &SessionContext<E>,
    established: &Established<E::Handle>,
    message: &RegularMessage,
) -> SessionResult<String> {
    if message.session_id != established.identity.session_id {
        return Err(SessionError::SessionMismatch(format!(
            "message for session {} delivered to session {}",
            message.session_id, established.identity.session_id
        )));
    }

    open(ctx, established, &message.salt, &message.ciphertext)
}

/// A live session of either role.
pub enum ActiveSession<E: CryptoEngine> {
    Initiator(InitiatorSession<E>),
    Responder(ResponderSession<E>),
}

impl<E: CryptoEngine> ActiveSession<E> {
    /// Rebuild a session from its persisted record.
    pub fn recover(ctx: std::sync::Arc<SessionContext<E>>, state: SessionState) -> Self {
        match state.identity.role {
            Role::Initiator => ActiveSession::Initiator(InitiatorSession::recover(ctx, state)),
            Role::Responder => ActiveSession::Responder(ResponderSession::recover(ctx, state)),
        }
    }

    fn inner(&self) -> &dyn SecureSession {
        match self {
            ActiveSession::Initiator(session) => session,
            ActiveSession::Responder(session) => session,
        }
    }

    pub fn as_responder(&self) -> Option<&ResponderSession<E>> {
        match self {
            ActiveSession::Responder(session) => Some(session),
            ActiveSession::Initiator(_) => None,
        }
    }
}

impl<E: CryptoEngine> fmt::Debug for ActiveSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("role", &self.role())
            .field("peer_card_id", self.peer_card_id())
            .field("phase", &self.phase())
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl<E: CryptoEngine> SecureSession for ActiveSession<E> {
    fn role(&self) -> Role {
        self.inner().role()
    }

    fn peer_card_id(&self) -> &CardId {
        self.inner().peer_card_id()
    }

    fn phase(&self) -> SessionPhase {
        self.inner().phase()
    }

    fn identity(&self) -> Option<&SecureSessionIdentity> {
        self.inner().identity()
    }

    fn initialize(&self) -> SessionResult<()> {
        self.inner().initialize()
    }

    fn encrypt(&self, plaintext: &str) -> SessionResult<String> {
        self.inner().encrypt(plaintext)
    }

    fn decrypt(&self, envelope: &str) -> SessionResult<String> {
        self.inner().decrypt(envelope)
    }
}
