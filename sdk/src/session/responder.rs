use {
    super::{
        open,
        open_regular,
        seal,
        Envelope,
        Established,
        HandshakeMessage,
        InitLatch,
        SecureSession,
        SessionPhase,
    },
    crate::{
        cards::{Card, CardId},
        context::SessionContext,
        crypto::{CryptoEngine, InitiatorPublicInfo, ResponderPrivateInfo},
        error::{SessionError, SessionResult},
        key_pool::PoolKey,
        state::{PeerKeys, Role, SecureSessionIdentity, SessionState},
    },
    chrono::{DateTime, Utc},
    std::sync::Arc,
};

/// Handshake a fresh responder session has not processed yet.
struct PendingHandshake {
    initiator_card: Card,
    message: HandshakeMessage,
}

/// Session of the party answering a handshake.
///
/// Initialization verifies the handshake, claims the referenced pool keys,
/// derives and authenticates the first message before anything is
/// persisted. It runs on the first [`initialize`], [`encrypt`] or handshake
/// [`decrypt`] call.
///
/// [`initialize`]: SecureSession::initialize
/// [`encrypt`]: SecureSession::encrypt
/// [`decrypt`]: SecureSession::decrypt
pub struct ResponderSession<E: CryptoEngine> {
    ctx: Arc<SessionContext<E>>,
    peer_card_id: CardId,
    pending: Option<PendingHandshake>,
    creation_date: DateTime<Utc>,
    expiration_date: DateTime<Utc>,
    latch: InitLatch<E::Handle>,
}

impl<E: CryptoEngine> ResponderSession<E> {
    /// A session answering `message`, sent by the owner of `initiator_card`.
    pub fn new(
        ctx: Arc<SessionContext<E>>,
        initiator_card: Card,
        message: HandshakeMessage,
    ) -> Self {
        let (creation_date, expiration_date) = ctx.session_window(Utc::now());

        Self {
            peer_card_id: initiator_card.id.clone(),
            pending: Some(PendingHandshake {
                initiator_card,
                message,
            }),
            creation_date,
            expiration_date,
            latch: InitLatch::new(),
            ctx,
        }
    }

    /// Rehydrate from a persisted record. The session is initialized (or
    /// failed) when this returns.
    pub fn recover(ctx: Arc<SessionContext<E>>, state: SessionState) -> Self {
        let peer_card_id = state.identity.peer_card_id.clone();
        let creation_date = state.identity.creation_date;
        let expiration_date = state.identity.expiration_date;

        let outcome = Established::recover(ctx.engine(), state, Role::Responder);
        match &outcome {
            Ok(established) => log::info!(
                "[session] Recovered responder session {} with {}",
                established.identity.session_id,
                peer_card_id
            ),
            Err(e) => log::error!(
                "[session] Could not recover responder session with {peer_card_id}: {e}"
            ),
        }

        Self {
            ctx,
            peer_card_id,
            pending: None,
            creation_date,
            expiration_date,
            latch: InitLatch::settled(outcome),
        }
    }

    /// Whether `message` is the handshake this session was built from.
    pub fn answers(&self, message: &HandshakeMessage) -> bool {
        match (&self.pending, self.latch.get()) {
            (Some(pending), _) => pending.message == *message,
            (None, Ok(established)) => {
                established.peer.ephemeral_public_key == message.eph_public_key
                    && established.peer.identity_card_id == message.initiator_card_id
            }
            (None, Err(_)) => false,
        }
    }

    fn ensure_initialized(&self) -> SessionResult<&Established<E::Handle>> {
        self.latch.get_or_init(|| {
            let Some(pending) = &self.pending else {
                return Err(SessionError::NotInitialized);
            };

            self.respond(pending).inspect_err(|e| {
                log::error!(
                    "[session] Rejected handshake from {}: {e}",
                    self.peer_card_id
                );
            })
        })
    }

    fn respond(&self, pending: &PendingHandshake) -> SessionResult<Established<E::Handle>> {
        let engine = self.ctx.engine();
        let message = &pending.message;
        let own_id = self.ctx.identity_card_id();

        if pending.initiator_card.id != message.initiator_card_id {
            return Err(SessionError::SessionMismatch(format!(
                "handshake claims initiator {} but card {} was supplied",
                message.initiator_card_id, pending.initiator_card.id
            )));
        }

        if &message.responder_card_id != own_id {
            return Err(SessionError::SessionMismatch(format!(
                "handshake is addressed to {}, not to {own_id}",
                message.responder_card_id
            )));
        }

        let initiator_identity = engine.import_public_key(&pending.initiator_card.public_key)?;

        if !engine.verify(
            &message.eph_public_key,
            &message.eph_public_key_signature,
            &initiator_identity,
        ) {
            return Err(SessionError::SignatureVerificationFailed);
        }

        let long_term_name = message.responder_lt_card_id.as_str();
        let long_term = self
            .ctx
            .key_pool()
            .get(long_term_name)
            .ok_or_else(|| SessionError::KeyNotFound(long_term_name.to_string()))?;

        let one_time = message.responder_ot_card_id.as_ref().and_then(|id| {
            let claimed = self.ctx.key_pool().claim_one_time(id.as_str());

            if claimed.is_none() {
                log::warn!(
                    "[session] One-time key {id} referenced by {} is gone, continuing without it",
                    self.peer_card_id
                );
            }

            claimed.map(|key| (id.clone(), key))
        });

        let outcome = self.derive(pending, initiator_identity, &long_term, one_time.as_ref());

        if outcome.is_err() {
            if let Some((id, key)) = one_time {
                self.ctx.key_pool().release_one_time(id.as_str(), key);
            }
        }

        outcome
    }

    fn derive(
        &self,
        pending: &PendingHandshake,
        initiator_identity: E::PublicKey,
        long_term: &PoolKey,
        one_time: Option<&(CardId, PoolKey)>,
    ) -> SessionResult<Established<E::Handle>> {
        let engine = self.ctx.engine();
        let message = &pending.message;

        let local = ResponderPrivateInfo {
            identity_key: self.ctx.identity_private_key()?,
            long_term_key: engine.import_private_key(long_term.private_key.as_slice())?,
            one_time_key: one_time
                .map(|(_, key)| engine.import_private_key(key.private_key.as_slice()))
                .transpose()?,
        };

        let peer = InitiatorPublicInfo {
            identity_key: initiator_identity,
            ephemeral_key: engine.import_public_key(&message.eph_public_key)?,
        };

        let derived =
            engine.derive_responder_session(&local, &peer, self.ctx.additional_data())?;

        let additional_data = self.ctx.additional_data();
        let established = Established {
            identity: SecureSessionIdentity {
                role: Role::Responder,
                peer_card_id: self.peer_card_id.clone(),
                session_id: derived.session_id,
                ephemeral_key_name: None,
                creation_date: self.creation_date,
                expiration_date: self.expiration_date,
                additional_data: (!additional_data.is_empty()).then(|| additional_data.to_vec()),
            },
            peer: PeerKeys {
                identity_card_id: pending.initiator_card.id.clone(),
                identity_public_key: pending.initiator_card.public_key.clone(),
                long_term_card_id: message.responder_lt_card_id.clone(),
                long_term_public_key: long_term.public_key.clone(),
                one_time_card_id: one_time.map(|(id, _)| id.clone()),
                one_time_public_key: one_time.map(|(_, key)| key.public_key.clone()),
                ephemeral_public_key: message.eph_public_key.clone(),
            },
            handle: derived.handle,
        };

        // The first message authenticates the derivation. Nothing is stored
        // for a handshake whose keys do not match.
        open(&self.ctx, &established, &message.salt, &message.ciphertext)?;

        self.ctx
            .store()
            .save(&self.peer_card_id, &established.to_state(engine))?;

        log::info!(
            "[session] Accepted session {} from {} (one-time card: {})",
            established.identity.session_id,
            self.peer_card_id,
            established.peer.one_time_card_id.is_some()
        );

        Ok(established)
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    pub fn expiration_date(&self) -> DateTime<Utc> {
        self.expiration_date
    }
}

impl<E: CryptoEngine> SecureSession for ResponderSession<E> {
    fn role(&self) -> Role {
        Role::Responder
    }

    fn peer_card_id(&self) -> &CardId {
        &self.peer_card_id
    }

    fn phase(&self) -> SessionPhase {
        self.latch.phase()
    }

    fn identity(&self) -> Option<&SecureSessionIdentity> {
        self.latch.identity()
    }

    fn initialize(&self) -> SessionResult<()> {
        self.ensure_initialized().map(|_| ())
    }

    fn encrypt(&self, plaintext: &str) -> SessionResult<String> {
        let established = self.ensure_initialized()?;

        seal(&self.ctx, established, plaintext)
    }

    fn decrypt(&self, envelope: &str) -> SessionResult<String> {
        match Envelope::parse(envelope)? {
            Envelope::Handshake(message) => {
                if !self.answers(&message) {
                    return Err(SessionError::SessionMismatch(format!(
                        "handshake from {} does not belong to this session",
                        message.initiator_card_id
                    )));
                }

                let established = self.ensure_initialized()?;

                open(&self.ctx, established, &message.salt, &message.ciphertext)
            }
            Envelope::Regular(message) => {
                let established = self.latch.get()?;

                open_regular(&self.ctx, established, &message)
            }
        }
    }
}
