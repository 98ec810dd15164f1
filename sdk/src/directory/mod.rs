//! Boundary to the external card directory.
//!
//! The directory resolves peers' [`KeyCardSet`]s, serves single cards, counts
//! a party's active one-time cards and accepts newly generated cards. Every
//! call is a network round-trip and the only place where the session manager
//! suspends. Retry policy belongs to the implementation.

#[cfg(feature = "http")]
mod http;
#[cfg(feature = "http")]
pub use http::*;

use {
    crate::cards::{Card, CardId, KeyCardSet},
    anyhow::Result,
    std::{future::Future, sync::Arc},
};

pub trait CardDirectory: Send + Sync + 'static {
    /// Current key card sets for `identities`. Peers without published
    /// cards are left out of the result.
    fn fetch_card_sets(
        &self,
        identities: &[CardId],
    ) -> impl Future<Output = Result<Vec<KeyCardSet>>> + Send;

    fn fetch_card(&self, id: &CardId) -> impl Future<Output = Result<Card>> + Send;

    /// Number of one-time cards of `owner` that are published and unused.
    fn fetch_active_one_time_count(
        &self,
        owner: &CardId,
    ) -> impl Future<Output = Result<usize>> + Send;

    fn publish_cards(&self, cards: Vec<Card>) -> impl Future<Output = Result<()>> + Send;
}

impl<D: CardDirectory> CardDirectory for Arc<D> {
    fn fetch_card_sets(
        &self,
        identities: &[CardId],
    ) -> impl Future<Output = Result<Vec<KeyCardSet>>> + Send {
        (**self).fetch_card_sets(identities)
    }

    fn fetch_card(&self, id: &CardId) -> impl Future<Output = Result<Card>> + Send {
        (**self).fetch_card(id)
    }

    fn fetch_active_one_time_count(
        &self,
        owner: &CardId,
    ) -> impl Future<Output = Result<usize>> + Send {
        (**self).fetch_active_one_time_count(owner)
    }

    fn publish_cards(&self, cards: Vec<Card>) -> impl Future<Output = Result<()>> + Send {
        (**self).publish_cards(cards)
    }
}
