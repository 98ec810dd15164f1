//! Session manager configuration, stored as TOML.
//!
//! ```toml
//! minimum_one_time_cards = 10
//! long_term_card_ttl_days = 7
//! one_time_key_ttl_days = 30
//! session_ttl_days = 7
//! session_cache_capacity = 64
//! additional_data = "Y2hhdC12MQ=="
//! ```

use {
    crate::error::{SessionError, SessionResult},
    base64::{engine::general_purpose::STANDARD, Engine as _},
    chrono::Duration,
    serde::{Deserialize, Serialize},
    std::{num::NonZeroUsize, path::Path},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionManagerConf {
    /// Published one-time cards the manager keeps available.
    #[serde(default = "default_minimum_one_time_cards")]
    pub minimum_one_time_cards: usize,
    /// Age after which a new long-term card is generated and published.
    #[serde(default = "default_long_term_card_ttl_days")]
    pub long_term_card_ttl_days: i64,
    /// Age after which an unused one-time key is retired.
    #[serde(default = "default_one_time_key_ttl_days")]
    pub one_time_key_ttl_days: i64,
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: i64,
    /// Upper bound of live sessions kept in memory.
    #[serde(default = "default_session_cache_capacity")]
    pub session_cache_capacity: usize,
    /// Base64 blob bound into every session derivation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<String>,
}

/// Upper bound for every `*_ttl_days` value.
pub const MAX_TTL_DAYS: i64 = 36_500;

fn default_minimum_one_time_cards() -> usize {
    10
}

fn default_long_term_card_ttl_days() -> i64 {
    7
}

fn default_one_time_key_ttl_days() -> i64 {
    30
}

fn default_session_ttl_days() -> i64 {
    7
}

fn default_session_cache_capacity() -> usize {
    64
}

impl Default for SessionManagerConf {
    fn default() -> Self {
        Self {
            minimum_one_time_cards: default_minimum_one_time_cards(),
            long_term_card_ttl_days: default_long_term_card_ttl_days(),
            one_time_key_ttl_days: default_one_time_key_ttl_days(),
            session_ttl_days: default_session_ttl_days(),
            session_cache_capacity: default_session_cache_capacity(),
            additional_data: None,
        }
    }
}

impl SessionManagerConf {
    pub async fn load_from_path(path: &Path) -> SessionResult<Self> {
        let conf = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SessionError::Conf(format!("Failed to read {path:?}: {e}")))?;

        let conf: Self = toml::from_str(&conf)
            .map_err(|e| SessionError::Conf(format!("Failed to parse {path:?}: {e}")))?;

        conf.validate()?;

        Ok(conf)
    }

    pub async fn save_to_path(&self, path: &Path) -> SessionResult<()> {
        let conf = toml::to_string_pretty(&self)
            .map_err(|e| SessionError::Conf(format!("Failed to encode configuration: {e}")))?;

        if let Some(parent_folder) = path.parent() {
            tokio::fs::create_dir_all(parent_folder)
                .await
                .map_err(|e| SessionError::Conf(format!("Failed to create {parent_folder:?}: {e}")))?;
        }

        tokio::fs::write(path, conf)
            .await
            .map_err(|e| SessionError::Conf(format!("Failed to write {path:?}: {e}")))
    }

    /// Reject values the manager cannot work with.
    pub fn validate(&self) -> SessionResult<()> {
        if self.session_cache_capacity == 0 {
            return Err(SessionError::Conf(
                "session_cache_capacity must be greater than zero".into(),
            ));
        }

        for (name, days) in [
            ("long_term_card_ttl_days", self.long_term_card_ttl_days),
            ("one_time_key_ttl_days", self.one_time_key_ttl_days),
            ("session_ttl_days", self.session_ttl_days),
        ] {
            if !(1..=MAX_TTL_DAYS).contains(&days) {
                return Err(SessionError::Conf(format!(
                    "{name} must be between 1 and {MAX_TTL_DAYS}, got {days}"
                )));
            }
        }

        self.additional_data_bytes().map(|_| ())
    }

    /// Decoded `additional_data`, empty when unset.
    pub fn additional_data_bytes(&self) -> SessionResult<Vec<u8>> {
        match &self.additional_data {
            Some(raw) => STANDARD
                .decode(raw)
                .map_err(|e| SessionError::Conf(format!("additional_data is not base64: {e}"))),
            None => Ok(vec![]),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        ttl(self.session_ttl_days)
    }

    pub fn long_term_card_ttl(&self) -> Duration {
        ttl(self.long_term_card_ttl_days)
    }

    pub fn one_time_key_ttl(&self) -> Duration {
        ttl(self.one_time_key_ttl_days)
    }

    pub fn cache_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.session_cache_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Values outside the validated range are clamped into it.
fn ttl(days: i64) -> Duration {
    Duration::days(days.clamp(1, MAX_TTL_DAYS))
}
