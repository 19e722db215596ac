use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Number of title words kept when turning a title into a search query.
const QUERY_WORDS: usize = 6;
const MIN_QUERY_LEN: usize = 3;

/// User agents for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// Turns an item identity into a human-readable title.
#[async_trait]
pub trait TitleResolver: Send + Sync {
    /// `Ok(None)` when the page is gone or has nothing usable; `Err` for
    /// failures worth retrying later.
    async fn resolve(&self, item_url: &str) -> Result<Option<String>>;
}

/// Fetches the listing page and reads its `<title>`.
#[derive(Debug, Clone)]
pub struct HtmlTitleResolver {
    client: Client,
}

impl HtmlTitleResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn random_user_agent() -> &'static str {
        let index = rand::thread_rng().gen_range(0..USER_AGENTS.len());
        USER_AGENTS[index]
    }
}

#[async_trait]
impl TitleResolver for HtmlTitleResolver {
    async fn resolve(&self, item_url: &str) -> Result<Option<String>> {
        info!("Resolving title for: {}", item_url);
        let response = self
            .client
            .get(item_url)
            .header("User-Agent", Self::random_user_agent())
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.5")
            .send()
            .await
            .map_err(|e| anyhow!("Failed to fetch listing: {}", e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            warn!("Listing {} is gone ({})", item_url, status);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("Listing fetch returned {} for {}", status, item_url));
        }

        let html = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read listing body: {}", e))?;
        let title = extract_title(&html).map(|raw| clean_title(&raw));
        debug!("Resolved title {:?}", title);
        Ok(title.filter(|t| !t.is_empty()))
    }
}

pub fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|node| node.text().collect::<String>())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn marketplace_noise() -> &'static Regex {
    static NOISE: OnceLock<Regex> = OnceLock::new();
    NOISE.get_or_init(|| Regex::new(r"(?i)for sale|ebay").expect("static regex"))
}

/// Keeps the part before the first `|` and strips marketplace boilerplate.
pub fn clean_title(raw: &str) -> String {
    let head = raw.split('|').next().unwrap_or_default();
    let stripped = marketplace_noise().replace_all(head, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Builds a search query from the leading words of a title.
///
/// Returns `None` when fewer than three characters survive.
pub fn derive_query(title: &str) -> Option<String> {
    let cleaned: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    let query = cleaned
        .split_whitespace()
        .take(QUERY_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    if query.len() < MIN_QUERY_LEN {
        None
    } else {
        Some(query)
    }
}
