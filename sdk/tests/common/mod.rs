#![allow(dead_code)]

use {
    anyhow::{anyhow, Result},
    card_sessions::{
        cards::{Card, CardId, CardKind, KeyCardSet},
        conf::SessionManagerConf,
        context::SessionContext,
        crypto::X3dhEngine,
        directory::CardDirectory,
        store::{MemorySessionStore, SessionStore},
        SessionManager,
    },
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
            Mutex,
        },
    },
    tokio::sync::Notify,
};

/// In-memory card directory. Handing out a one-time card in a card set
/// consumes it, like the real service does.
#[derive(Default)]
pub struct MemoryCardDirectory {
    cards: Mutex<HashMap<CardId, Vec<Card>>>,
    identities: Mutex<HashMap<CardId, Card>>,
    pub card_set_calls: AtomicUsize,
    pub publish_calls: AtomicUsize,
    pub fail_identity_lookup: Mutex<bool>,
    pub fail_count_lookup: Mutex<bool>,
    pub fail_publish: Mutex<bool>,
    /// Overrides the active one-time count reported for every owner.
    pub reported_count: Mutex<Option<usize>>,
    /// Skip one-time cards when building card sets.
    pub withhold_one_time: Mutex<bool>,
    /// Hold the one-time count lookup until notified.
    pub count_gate: Mutex<Option<Arc<Notify>>>,
}

impl MemoryCardDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_identity(&self, card: Card) {
        self.identities.lock().unwrap().insert(card.id.clone(), card);
    }

    pub fn published(&self, owner: &CardId) -> Vec<Card> {
        self.cards
            .lock()
            .unwrap()
            .get(owner)
            .cloned()
            .unwrap_or_default()
    }

    pub fn published_of_kind(&self, owner: &CardId, kind: CardKind) -> usize {
        self.published(owner)
            .iter()
            .filter(|c| c.kind == kind)
            .count()
    }

    /// Replace a published card, e.g. to tamper with it.
    pub fn replace_card(&self, owner: &CardId, card: Card) {
        let mut cards = self.cards.lock().unwrap();
        let owned = cards.entry(owner.clone()).or_default();
        owned.retain(|c| c.id != card.id);
        owned.push(card);
    }
}

impl CardDirectory for MemoryCardDirectory {
    async fn fetch_card_sets(&self, identities: &[CardId]) -> Result<Vec<KeyCardSet>> {
        self.card_set_calls.fetch_add(1, Ordering::SeqCst);

        let known = self.identities.lock().unwrap().clone();
        let withhold = *self.withhold_one_time.lock().unwrap();
        let mut cards = self.cards.lock().unwrap();
        let mut sets = vec![];

        for id in identities {
            let Some(identity_card) = known.get(id) else {
                continue;
            };
            let owned = cards.entry(id.clone()).or_default();

            let Some(long_term_card) = owned
                .iter()
                .filter(|c| c.kind == CardKind::LongTerm)
                .max_by_key(|c| c.created_at)
                .cloned()
            else {
                continue;
            };

            let one_time_card = if withhold {
                None
            } else {
                owned
                    .iter()
                    .position(|c| c.kind == CardKind::OneTime)
                    .map(|i| owned.remove(i))
            };

            sets.push(KeyCardSet {
                identity_card: identity_card.clone(),
                long_term_card,
                one_time_card,
            });
        }

        Ok(sets)
    }

    async fn fetch_card(&self, id: &CardId) -> Result<Card> {
        if *self.fail_identity_lookup.lock().unwrap() {
            return Err(anyhow!("identity service unavailable"));
        }

        self.identities
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("card {id} not found"))
    }

    async fn fetch_active_one_time_count(&self, owner: &CardId) -> Result<usize> {
        // Let the concurrent identity lookup run first.
        tokio::task::yield_now().await;

        let gate = self.count_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if *self.fail_count_lookup.lock().unwrap() {
            return Err(anyhow!("count service unavailable"));
        }

        if let Some(count) = *self.reported_count.lock().unwrap() {
            return Ok(count);
        }

        Ok(self.published_of_kind(owner, CardKind::OneTime))
    }

    async fn publish_cards(&self, cards: Vec<Card>) -> Result<()> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        if *self.fail_publish.lock().unwrap() {
            return Err(anyhow!("publication rejected"));
        }

        let mut published = self.cards.lock().unwrap();
        for card in cards {
            published.entry(card.owner.clone()).or_default().push(card);
        }

        Ok(())
    }
}

pub type TestManager = SessionManager<Arc<MemoryCardDirectory>, X3dhEngine>;

pub fn conf(minimum_one_time_cards: usize) -> SessionManagerConf {
    SessionManagerConf {
        minimum_one_time_cards,
        ..Default::default()
    }
}

/// A manager with a fresh identity registered in `directory`.
pub fn party(
    directory: &Arc<MemoryCardDirectory>,
    store: Arc<dyn SessionStore>,
    conf: SessionManagerConf,
) -> TestManager {
    let ctx = SessionContext::generate(Arc::new(X3dhEngine::new()), store, conf).unwrap();
    directory.register_identity(ctx.identity_card().clone());

    SessionManager::new(Arc::clone(directory), ctx)
}

/// An initialized manager backed by an in-memory store.
pub async fn ready_party(directory: &Arc<MemoryCardDirectory>, minimum: usize) -> TestManager {
    let manager = party(directory, Arc::new(MemorySessionStore::new()), conf(minimum));
    manager.initialize().await.unwrap();
    manager
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
