use {
    super::CardDirectory,
    crate::cards::{Card, CardId, KeyCardSet},
    anyhow::{anyhow, Context, Result},
    reqwest::{Client, Response, Url},
    serde::{Deserialize, Serialize},
};

/// Default card directory endpoint.
pub const CARD_DIRECTORY_URL: &str = "http://127.0.0.1:8700";

#[derive(Serialize)]
struct CardSetsRequest<'a> {
    identities: &'a [CardId],
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    cards: &'a [Card],
}

#[derive(Deserialize)]
struct CountResponse {
    count: usize,
}

/// Builder for HttpCardDirectory configuration
pub struct HttpCardDirectoryBuilder {
    client: Client,
    base_url: String,
}

impl Default for HttpCardDirectoryBuilder {
    fn default() -> Self {
        Self {
            client: Client::new(),
            base_url: CARD_DIRECTORY_URL.to_string(),
        }
    }
}

impl HttpCardDirectoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a custom HTTP client
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Set a custom directory URL. A trailing slash is ignored.
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn build(self) -> HttpCardDirectory {
        HttpCardDirectory {
            client: self.client,
            base_url: self.base_url,
        }
    }
}

/// [`CardDirectory`] backed by the card directory's REST API.
pub struct HttpCardDirectory {
    client: Client,
    base_url: String,
}

impl Default for HttpCardDirectory {
    fn default() -> Self {
        HttpCardDirectoryBuilder::default().build()
    }
}

impl HttpCardDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a builder to create a customized HttpCardDirectory
    pub fn builder() -> HttpCardDirectoryBuilder {
        HttpCardDirectoryBuilder::default()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/{segments..}`. Card ids are opaque, so every segment is
    /// percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid directory URL '{}'", self.base_url))?;

        url.path_segments_mut()
            .map_err(|_| anyhow!("Directory URL '{}' cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    /// Turn a non-2xx response into an error carrying the response body.
    async fn check(response: Response, what: &str) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();

        Err(anyhow!("{what} failed with {status}: {error_text}"))
    }
}

impl CardDirectory for HttpCardDirectory {
    /// `POST {base}/v1/card-sets` with `{"identities": [..]}`.
    async fn fetch_card_sets(&self, identities: &[CardId]) -> Result<Vec<KeyCardSet>> {
        let url = self.endpoint(&["v1", "card-sets"])?;

        let response = self
            .client
            .post(url)
            .json(&CardSetsRequest { identities })
            .send()
            .await
            .context("Failed to fetch card sets")?;

        let sets = Self::check(response, "Card set lookup")
            .await?
            .json::<Vec<KeyCardSet>>()
            .await
            .context("Failed to parse card sets")?;

        log::debug!(
            "[directory] Resolved {} card set(s) for {} identities",
            sets.len(),
            identities.len()
        );

        Ok(sets)
    }

    /// `GET {base}/v1/cards/{id}`.
    async fn fetch_card(&self, id: &CardId) -> Result<Card> {
        let url = self.endpoint(&["v1", "cards", id.as_str()])?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to fetch card")?;

        Self::check(response, "Card lookup")
            .await?
            .json::<Card>()
            .await
            .context("Failed to parse card")
    }

    /// `GET {base}/v1/cards/{owner}/one-time/count` returning `{"count": n}`.
    async fn fetch_active_one_time_count(&self, owner: &CardId) -> Result<usize> {
        let url = self.endpoint(&["v1", "cards", owner.as_str(), "one-time", "count"])?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to fetch one-time card count")?;

        let count = Self::check(response, "One-time card count")
            .await?
            .json::<CountResponse>()
            .await
            .context("Failed to parse one-time card count")?;

        Ok(count.count)
    }

    /// `POST {base}/v1/cards` with `{"cards": [..]}`.
    async fn publish_cards(&self, cards: Vec<Card>) -> Result<()> {
        let url = self.endpoint(&["v1", "cards"])?;

        let response = self
            .client
            .post(url)
            .json(&PublishRequest { cards: &cards })
            .send()
            .await
            .context("Failed to publish cards")?;

        Self::check(response, "Card publication").await?;

        log::info!("[directory] Published {} card(s)", cards.len());

        Ok(())
    }
}
