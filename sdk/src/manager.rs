//! # Session manager
//!
//! [`SessionManager`] owns the local identity and key pool (through its
//! [`SessionContext`]), keeps the published pre-key pool topped up and hands
//! out one [`ActiveSession`] per peer.
//!
//! * **Initiating**: [`SessionManager::start_session`] reuses a live or
//!   stored session for the peer and otherwise resolves the peer's
//!   [`KeyCardSet`](crate::cards::KeyCardSet) through the directory.
//! * **Responding**: [`SessionManager::load_up_session`] builds a responder
//!   session from an inbound handshake.
//!
//! Directory round-trips are the only suspension points. Calls still in
//! flight when [`SessionManager::shutdown`] runs resolve to
//! [`SessionError::ManagerClosed`] and leave no trace.

use {
    crate::{
        cards::{Card, CardId, CardKind},
        context::SessionContext,
        crypto::CryptoEngine,
        directory::CardDirectory,
        error::{SessionError, SessionResult},
        key_pool::{KeyKind, PoolKey},
        session::{
            ActiveSession,
            Envelope,
            InitiatorSession,
            ResponderSession,
            SecureSession,
            SessionPhase,
        },
    },
    chrono::Utc,
    lru::LruCache,
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        MutexGuard,
    },
};

pub struct SessionManager<D: CardDirectory, E: CryptoEngine> {
    directory: D,
    ctx: Arc<SessionContext<E>>,
    sessions: Mutex<LruCache<CardId, Arc<ActiveSession<E>>>>,
    ready: AtomicBool,
    closed: AtomicBool,
}

impl<D: CardDirectory, E: CryptoEngine> SessionManager<D, E> {
    pub fn new(directory: D, ctx: SessionContext<E>) -> Self {
        let capacity = ctx.conf().cache_capacity();

        Self {
            directory,
            ctx: Arc::new(ctx),
            sessions: Mutex::new(LruCache::new(capacity)),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<SessionContext<E>> {
        &self.ctx
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn identity_card(&self) -> &Card {
        self.ctx.identity_card()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn sessions(&self) -> MutexGuard<'_, LruCache<CardId, Arc<ActiveSession<E>>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::ManagerClosed);
        }

        Ok(())
    }

    fn ensure_ready(&self) -> SessionResult<()> {
        self.ensure_open()?;

        if !self.ready.load(Ordering::Acquire) {
            return Err(SessionError::NotInitialized);
        }

        Ok(())
    }

    /// Check the published identity card and top up the pre-key pool.
    ///
    /// The identity card and the active one-time card count are fetched
    /// concurrently. Both must succeed before the key pool is touched.
    pub async fn initialize(&self) -> SessionResult<()> {
        self.ensure_open()?;

        let own_id = self.ctx.identity_card_id().clone();

        let (card, count) = tokio::join!(
            self.directory.fetch_card(&own_id),
            self.directory.fetch_active_one_time_count(&own_id),
        );

        // Shutdown while the lookups were in flight.
        self.ensure_open()?;

        let (card, count) = match (card, count) {
            (Ok(card), Ok(count)) => (card, count),
            (Err(card_err), Err(count_err)) => {
                return Err(SessionError::Directory(format!(
                    "{card_err:#}; {count_err:#}"
                )))
            }
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => return Err(SessionError::directory(e)),
        };

        if card.public_key != self.ctx.identity_card().public_key {
            return Err(SessionError::IdentityMismatch(card.id.to_string()));
        }

        let missing = self.ctx.conf().minimum_one_time_cards.saturating_sub(count);
        self.publish_pre_keys(missing).await?;

        self.ready.store(true, Ordering::Release);

        log::info!(
            "[manager] Initialized {own_id} ({count} active one-time cards, {missing} published)"
        );

        Ok(())
    }

    /// Publish enough one-time cards to reach the configured minimum and a
    /// new long-term card when the current one aged out. Returns the number
    /// of one-time cards published.
    pub async fn replenish_keys(&self) -> SessionResult<usize> {
        self.ensure_ready()?;

        let own_id = self.ctx.identity_card_id();
        let count = self
            .directory
            .fetch_active_one_time_count(own_id)
            .await
            .map_err(SessionError::directory)?;

        self.ensure_open()?;

        let missing = self.ctx.conf().minimum_one_time_cards.saturating_sub(count);
        self.publish_pre_keys(missing).await?;

        Ok(missing)
    }

    /// Drop local pre-keys that outlived their policy. Long-term keys get
    /// one extra rotation period so handshakes still in transit can land.
    pub fn retire_expired_keys(&self) -> Vec<String> {
        let conf = self.ctx.conf();
        let retired = self.ctx.key_pool().retire_expired(
            Utc::now(),
            conf.long_term_card_ttl() * 2,
            conf.one_time_key_ttl(),
        );

        if !retired.is_empty() {
            log::info!("[manager] Retired {} expired pre-key(s)", retired.len());
        }

        retired
    }

    /// Generate `one_time` one-time keys (plus a long-term key when none is
    /// active), add them to the pool and publish their cards. On publication
    /// failure the new keys are removed again.
    async fn publish_pre_keys(&self, one_time: usize) -> SessionResult<()> {
        let now = Utc::now();
        let pool = self.ctx.key_pool();
        let needs_long_term = pool
            .active_long_term(now, self.ctx.conf().long_term_card_ttl())
            .is_none();

        let mut cards = Vec::with_capacity(one_time + 1);

        if needs_long_term {
            cards.push(self.generate_pre_key(CardKind::LongTerm)?);
        }

        for _ in 0..one_time {
            cards.push(self.generate_pre_key(CardKind::OneTime)?);
        }

        if cards.is_empty() {
            return Ok(());
        }

        let names = cards.iter().map(|c| c.id.to_string()).collect::<Vec<_>>();

        let published = self.directory.publish_cards(cards).await;

        if let Err(e) = published {
            for name in &names {
                pool.retire(name);
            }

            return Err(SessionError::directory(e));
        }

        if self.is_closed() {
            return Err(SessionError::ManagerClosed);
        }

        log::info!(
            "[manager] Published {one_time} one-time card(s){}",
            if needs_long_term {
                " and a long-term card"
            } else {
                ""
            }
        );

        Ok(())
    }

    fn generate_pre_key(&self, kind: CardKind) -> SessionResult<Card> {
        let pair = self.ctx.engine().generate_key_pair();
        let signature = self.ctx.sign(&pair.public_key)?;
        let key_kind = match kind {
            CardKind::LongTerm => KeyKind::LongTerm,
            _ => KeyKind::OneTime,
        };

        let card = Card::signed(
            kind,
            self.ctx.identity_card_id().clone(),
            pair.public_key.clone(),
            signature,
        );

        self.ctx.key_pool().insert(
            card.id.to_string(),
            PoolKey::new(key_kind, &pair.private_key, pair.public_key),
        );

        Ok(card)
    }

    /// The live session with `peer`, recovering it from the store if needed.
    /// Expired and failed sessions are treated as absent.
    pub fn active_session(&self, peer: &CardId) -> SessionResult<Option<Arc<ActiveSession<E>>>> {
        self.ensure_open()?;

        let now = Utc::now();

        {
            let mut sessions = self.sessions();

            if let Some(session) = sessions.get(peer) {
                if session.phase() == SessionPhase::Failed {
                    log::warn!("[manager] Dropping failed session with {peer}");
                } else if session.is_expired(now) {
                    log::warn!("[manager] Session with {peer} expired");
                } else {
                    return Ok(Some(Arc::clone(session)));
                }

                sessions.pop(peer);

                return Ok(None);
            }
        }

        let Some(state) = self.ctx.store().load(peer)? else {
            return Ok(None);
        };

        if state.identity.is_expired(now) {
            log::warn!("[manager] Stored session with {peer} expired");

            return Ok(None);
        }

        let session = ActiveSession::recover(Arc::clone(&self.ctx), state);
        // Recovery settles the session, a failed one is surfaced here.
        session.initialize()?;

        let session = Arc::new(session);
        self.sessions().put(peer.clone(), Arc::clone(&session));

        Ok(Some(session))
    }

    /// The session with `peer`, creating one if no usable session exists.
    pub async fn start_session(&self, peer: &CardId) -> SessionResult<Arc<ActiveSession<E>>> {
        self.ensure_ready()?;

        if let Some(session) = self.active_session(peer)? {
            return Ok(session);
        }

        self.start_new_session(peer).await
    }

    /// Resolve `peer`'s current cards and create a fresh initiator session,
    /// superseding any existing one.
    pub async fn start_new_session(&self, peer: &CardId) -> SessionResult<Arc<ActiveSession<E>>> {
        self.ensure_ready()?;

        let card_sets = self
            .directory
            .fetch_card_sets(std::slice::from_ref(peer))
            .await
            .map_err(SessionError::directory)?;

        self.ensure_open()?;

        let card_set = card_sets
            .into_iter()
            .find(|set| set.identity_id() == peer)
            .ok_or_else(|| SessionError::Directory(format!("no card set published for {peer}")))?;

        let session = Arc::new(ActiveSession::Initiator(InitiatorSession::new(
            Arc::clone(&self.ctx),
            card_set,
        )));

        if self.sessions().put(peer.clone(), Arc::clone(&session)).is_some() {
            log::info!("[manager] New session with {peer} supersedes the previous one");
        }

        Ok(session)
    }

    /// Build and initialize the responder session for an inbound handshake.
    ///
    /// A repeated delivery of the same handshake returns the existing
    /// session. A handshake whose signature does not verify invalidates the
    /// session stored for that peer.
    ///
    /// Building such a handshake needs only the initiator's public identity
    /// card. Anyone who can deliver messages can therefore force the session
    /// with that peer to be rebuilt. The forged handshake never yields a
    /// session.
    pub fn load_up_session(
        &self,
        initiator_card: &Card,
        envelope: &str,
    ) -> SessionResult<Arc<ActiveSession<E>>> {
        self.ensure_ready()?;

        let Envelope::Handshake(message) = Envelope::parse(envelope)? else {
            return Err(SessionError::Decoding(
                "expected a handshake envelope".into(),
            ));
        };

        let peer = initiator_card.id.clone();

        if let Some(existing) = self.sessions().get(&peer) {
            if existing.as_responder().is_some_and(|s| s.answers(&message)) {
                return Ok(Arc::clone(existing));
            }
        }

        let session = ResponderSession::new(Arc::clone(&self.ctx), initiator_card.clone(), message);

        match session.initialize() {
            Ok(()) => {}
            Err(SessionError::SignatureVerificationFailed) => {
                log::error!("[manager] Invalid handshake signature from {peer}");
                self.invalidate(&peer)?;

                return Err(SessionError::SignatureVerificationFailed);
            }
            Err(e) => return Err(e),
        }

        let session = Arc::new(ActiveSession::Responder(session));

        if self.sessions().put(peer.clone(), Arc::clone(&session)).is_some() {
            log::info!("[manager] Handshake from {peer} supersedes the previous session");
        }

        Ok(session)
    }

    /// Forget the session with `peer`, in memory and in the store.
    pub fn remove_session(&self, peer: &CardId) -> SessionResult<()> {
        self.ensure_open()?;
        self.invalidate(peer)
    }

    fn invalidate(&self, peer: &CardId) -> SessionResult<()> {
        self.sessions().pop(peer);
        self.ctx.store().delete(peer)?;

        log::info!("[manager] Removed session with {peer}");

        Ok(())
    }

    /// Tear down the manager. Live sessions are dropped from memory; stored
    /// state is kept.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.sessions().clear();

        log::info!("[manager] Shut down {}", self.ctx.identity_card_id());
    }
}
