use {
    super::{
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
        cards::{CardId, KeyCardSet},
        context::SessionContext,
        crypto::{CryptoEngine, InitiatorPrivateInfo, ResponderPublicInfo},
        error::{SessionError, SessionResult},
        key_pool::{ephemeral_key_name, KeyKind, PoolKey},
        state::{PeerKeys, Role, SecureSessionIdentity, SessionState},
    },
    chrono::{DateTime, Utc},
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Session of the party that starts the conversation.
///
/// A fresh session derives lazily inside its first [`encrypt`], persists its
/// state and returns the handshake envelope from that same call. The ephemeral
/// private key leaves the key pool as soon as derivation has run. A recovered
/// session is initialized in [`InitiatorSession::recover`] and never embeds a
/// handshake again.
///
/// [`encrypt`]: SecureSession::encrypt
pub struct InitiatorSession<E: CryptoEngine> {
    ctx: Arc<SessionContext<E>>,
    peer_card_id: CardId,
    /// Present only on fresh sessions.
    card_set: Option<KeyCardSet>,
    creation_date: DateTime<Utc>,
    expiration_date: DateTime<Utc>,
    latch: InitLatch<E::Handle>,
    handshake_pending: AtomicBool,
}

impl<E: CryptoEngine> InitiatorSession<E> {
    /// A session with `card_set`'s owner. Nothing is derived until the first
    /// [`encrypt`](SecureSession::encrypt).
    pub fn new(ctx: Arc<SessionContext<E>>, card_set: KeyCardSet) -> Self {
        let (creation_date, expiration_date) = ctx.session_window(Utc::now());

        Self {
            peer_card_id: card_set.identity_id().clone(),
            card_set: Some(card_set),
            creation_date,
            expiration_date,
            latch: InitLatch::new(),
            handshake_pending: AtomicBool::new(true),
            ctx,
        }
    }

    /// Rehydrate from a persisted record. The session is initialized (or
    /// failed) when this returns.
    pub fn recover(ctx: Arc<SessionContext<E>>, state: SessionState) -> Self {
        let peer_card_id = state.identity.peer_card_id.clone();
        let creation_date = state.identity.creation_date;
        let expiration_date = state.identity.expiration_date;

        let outcome = Established::recover(ctx.engine(), state, Role::Initiator);
        match &outcome {
            Ok(established) => log::info!(
                "[session] Recovered initiator session {} with {}",
                established.identity.session_id,
                peer_card_id
            ),
            Err(e) => log::error!(
                "[session] Could not recover initiator session with {peer_card_id}: {e}"
            ),
        }

        Self {
            ctx,
            peer_card_id,
            card_set: None,
            creation_date,
            expiration_date,
            latch: InitLatch::settled(outcome),
            handshake_pending: AtomicBool::new(false),
        }
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    pub fn expiration_date(&self) -> DateTime<Utc> {
        self.expiration_date
    }

    fn ensure_initialized(&self) -> SessionResult<&Established<E::Handle>> {
        self.latch.get_or_init(|| {
            let Some(card_set) = &self.card_set else {
                return Err(SessionError::NotInitialized);
            };

            let ephemeral_name = self.generate_ephemeral();
            let outcome = self.initiate(card_set, &ephemeral_name);

            // Only the public half is needed once derivation has run.
            self.ctx.key_pool().retire(&ephemeral_name);

            if let Err(e) = &outcome {
                log::error!(
                    "[session] Failed to initiate session with {}: {e}",
                    self.peer_card_id
                );
            }

            outcome
        })
    }

    /// Generate an ephemeral key and park it in the pool.
    fn generate_ephemeral(&self) -> String {
        let pair = self.ctx.engine().generate_key_pair();
        let name = ephemeral_key_name(&pair.public_key);

        self.ctx.key_pool().insert(
            name.clone(),
            PoolKey::new(KeyKind::Ephemeral, &pair.private_key, pair.public_key),
        );

        name
    }

    fn initiate(
        &self,
        card_set: &KeyCardSet,
        ephemeral_name: &str,
    ) -> SessionResult<Established<E::Handle>> {
        let engine = self.ctx.engine();

        card_set.verify(engine)?;

        let ephemeral = self
            .ctx
            .key_pool()
            .get(ephemeral_name)
            .ok_or_else(|| SessionError::KeyNotFound(ephemeral_name.to_string()))?;

        let local = InitiatorPrivateInfo {
            identity_key: self.ctx.identity_private_key()?,
            ephemeral_key: engine.import_private_key(ephemeral.private_key.as_slice())?,
        };

        let peer = ResponderPublicInfo {
            identity_key: engine.import_public_key(&card_set.identity_card.public_key)?,
            long_term_key: engine.import_public_key(&card_set.long_term_card.public_key)?,
            one_time_key: card_set
                .one_time_card
                .as_ref()
                .map(|card| engine.import_public_key(&card.public_key))
                .transpose()?,
        };

        let derived =
            engine.derive_initiator_session(&local, &peer, self.ctx.additional_data())?;

        let additional_data = self.ctx.additional_data();
        let established = Established {
            identity: SecureSessionIdentity {
                role: Role::Initiator,
                peer_card_id: self.peer_card_id.clone(),
                session_id: derived.session_id,
                ephemeral_key_name: Some(ephemeral_name.to_string()),
                creation_date: self.creation_date,
                expiration_date: self.expiration_date,
                additional_data: (!additional_data.is_empty()).then(|| additional_data.to_vec()),
            },
            peer: PeerKeys {
                identity_card_id: card_set.identity_card.id.clone(),
                identity_public_key: card_set.identity_card.public_key.clone(),
                long_term_card_id: card_set.long_term_card.id.clone(),
                long_term_public_key: card_set.long_term_card.public_key.clone(),
                one_time_card_id: card_set.one_time_card.as_ref().map(|c| c.id.clone()),
                one_time_public_key: card_set
                    .one_time_card
                    .as_ref()
                    .map(|c| c.public_key.clone()),
                ephemeral_public_key: ephemeral.public_key.clone(),
            },
            handle: derived.handle,
        };

        self.ctx
            .store()
            .save(&self.peer_card_id, &established.to_state(engine))?;

        log::info!(
            "[session] Initiated session {} with {} (one-time card: {})",
            established.identity.session_id,
            self.peer_card_id,
            established.peer.one_time_card_id.is_some()
        );

        Ok(established)
    }

    fn handshake(
        &self,
        established: &Established<E::Handle>,
        plaintext: &str,
    ) -> SessionResult<String> {
        let peer = &established.peer;
        let signature = self.ctx.sign(&peer.ephemeral_public_key)?;
        let sealed = self
            .ctx
            .engine()
            .encrypt_with(&established.handle, plaintext.as_bytes())?;

        Envelope::Handshake(HandshakeMessage {
            initiator_card_id: self.ctx.identity_card_id().clone(),
            responder_card_id: peer.identity_card_id.clone(),
            responder_lt_card_id: peer.long_term_card_id.clone(),
            responder_ot_card_id: peer.one_time_card_id.clone(),
            eph_public_key: peer.ephemeral_public_key.clone(),
            eph_public_key_signature: signature,
            salt: sealed.salt,
            ciphertext: sealed.ciphertext,
        })
        .to_wire()
    }
}

impl<E: CryptoEngine> SecureSession for InitiatorSession<E> {
    fn role(&self) -> Role {
        Role::Initiator
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

        if self
            .handshake_pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return self.handshake(established, plaintext).inspect_err(|_| {
                self.handshake_pending.store(true, Ordering::Release);
            });
        }

        seal(&self.ctx, established, plaintext)
    }

    fn decrypt(&self, envelope: &str) -> SessionResult<String> {
        // Initiators always speak first, decrypt never initializes.
        let established = self.latch.get()?;

        match Envelope::parse(envelope)? {
            Envelope::Regular(message) => open_regular(&self.ctx, established, &message),
            Envelope::Handshake(handshake) => Err(SessionError::SessionMismatch(format!(
                "handshake from {} delivered to an initiator session",
                handshake.initiator_card_id
            ))),
        }
    }
}
