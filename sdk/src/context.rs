//! Everything a session needs from its process, passed explicitly.

use {
    crate::{
        cards::{Card, CardId},
        conf::SessionManagerConf,
        crypto::{secret_bytes::SecretBytes, CryptoEngine},
        error::SessionResult,
        key_pool::LocalKeyPool,
        store::SessionStore,
    },
    chrono::{DateTime, Utc},
    std::sync::Arc,
};

/// Local identity, shared key pool, engine, store and configuration.
pub struct SessionContext<E: CryptoEngine> {
    identity_card: Card,
    identity_key: SecretBytes,
    key_pool: Arc<LocalKeyPool>,
    engine: Arc<E>,
    store: Arc<dyn SessionStore>,
    conf: SessionManagerConf,
    additional_data: Vec<u8>,
}

impl<E: CryptoEngine> SessionContext<E> {
    /// Build a context around an existing identity private key.
    pub fn new(
        engine: Arc<E>,
        identity_private_key: &[u8],
        key_pool: Arc<LocalKeyPool>,
        store: Arc<dyn SessionStore>,
        conf: SessionManagerConf,
    ) -> SessionResult<Self> {
        conf.validate()?;

        let identity = engine.import_private_key(identity_private_key)?;
        let identity_card = Card::identity(engine.public_key_bytes(&identity));
        let additional_data = conf.additional_data_bytes()?;

        Ok(Self {
            identity_card,
            identity_key: SecretBytes::from(identity_private_key),
            key_pool,
            engine,
            store,
            conf,
            additional_data,
        })
    }

    /// Build a context around a freshly generated identity.
    pub fn generate(
        engine: Arc<E>,
        store: Arc<dyn SessionStore>,
        conf: SessionManagerConf,
    ) -> SessionResult<Self> {
        let identity = engine.generate_key_pair();

        Self::new(
            engine,
            &identity.private_key,
            Arc::new(LocalKeyPool::new()),
            store,
            conf,
        )
    }

    pub fn identity_card(&self) -> &Card {
        &self.identity_card
    }

    pub fn identity_card_id(&self) -> &CardId {
        &self.identity_card.id
    }

    pub fn identity_private_key(&self) -> SessionResult<E::PrivateKey> {
        Ok(self.engine.import_private_key(self.identity_key.as_slice())?)
    }

    pub fn key_pool(&self) -> &Arc<LocalKeyPool> {
        &self.key_pool
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    pub fn conf(&self) -> &SessionManagerConf {
        &self.conf
    }

    pub fn additional_data(&self) -> &[u8] {
        &self.additional_data
    }

    /// `(creation, expiration)` for a session created at `now`.
    pub fn session_window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let expiration = now
            .checked_add_signed(self.conf.session_ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        (now, expiration)
    }

    /// Sign `data` with the local identity key.
    pub fn sign(&self, data: &[u8]) -> SessionResult<Vec<u8>> {
        let identity = self.identity_private_key()?;

        Ok(self.engine.sign(data, &identity))
    }
}
