use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::pricing::{Confidence, Verdict};
use crate::quota::Tier;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_CONDITION: &str = "Used";

/// Body of `POST /compare` and arguments of the `compare_listing` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompareRequest {
    /// Listing page to price. Either this or `rawQuery` is required.
    #[serde(default, alias = "itemIdentity")]
    pub listing_url: Option<String>,
    /// Search query to use directly. Takes precedence over `listingUrl`.
    #[serde(default)]
    pub raw_query: Option<String>,
    /// Purchase price, as a number or a string such as "$1,250.00".
    #[serde(default)]
    pub buy_price: Option<serde_json::Value>,
    /// Item condition, defaults to "Used".
    #[serde(default)]
    pub condition: Option<String>,
    /// Caller identity the daily quota is counted against.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Skip the fresh cache read and do not store the result.
    #[serde(default)]
    pub bypass_cache: bool,
}

/// What the caller wants priced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemIdentity {
    Listing { url: String, key: String },
    Query { query: String, key: String },
}

impl ItemIdentity {
    pub fn listing(raw: &str) -> GatewayResult<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| GatewayError::Validation(format!("invalid listingUrl: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(GatewayError::Validation(
                "listingUrl must start with http:// or https://".into(),
            ));
        }
        let key = listing_key(&url);
        Ok(ItemIdentity::Listing {
            url: url.to_string(),
            key,
        })
    }

    pub fn query(raw: &str) -> GatewayResult<Self> {
        let query = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if query.is_empty() {
            return Err(GatewayError::Validation("rawQuery is empty".into()));
        }
        let key = format!("q:{}", query.to_lowercase());
        Ok(ItemIdentity::Query { query, key })
    }

    /// Normalised identity used in cache and single-flight keys.
    pub fn key(&self) -> &str {
        match self {
            ItemIdentity::Listing { key, .. } | ItemIdentity::Query { key, .. } => key,
        }
    }

    /// How the caller referred to the item, echoed back in results.
    pub fn display(&self) -> &str {
        match self {
            ItemIdentity::Listing { url, .. } => url,
            ItemIdentity::Query { query, .. } => query,
        }
    }
}

/// `itm:<id>` for item pages, lower-cased host and path otherwise.
fn listing_key(url: &Url) -> String {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    if let Some(pos) = segments.iter().position(|s| s.eq_ignore_ascii_case("itm")) {
        let id = segments[pos + 1..]
            .iter()
            .rev()
            .find(|s| s.chars().all(|c| c.is_ascii_digit()));
        if let Some(id) = id {
            return format!("itm:{id}");
        }
    }
    let host = url.host_str().unwrap_or_default().to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    format!("{}/{}", host, segments.join("/").to_lowercase())
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub item: ItemIdentity,
    pub buy_price: f64,
    pub condition: String,
    pub client_id: String,
    pub bypass_cache: bool,
}

impl Comparison {
    /// Key a priced result is cached and deduplicated under.
    pub fn cache_key(&self) -> String {
        format!(
            "{}|{:.2}|{}",
            self.item.key(),
            self.buy_price,
            self.condition.to_lowercase()
        )
    }
}

/// Parses the buy price and rounds it to cents, the precision it is keyed on.
fn parse_buy_price(raw: Option<&serde_json::Value>) -> GatewayResult<f64> {
    let price = match raw {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => {
            let digits: String = s.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
            digits.parse::<f64>().ok()
        }
        _ => None,
    };
    match price.map(|p| (p * 100.0).round() / 100.0) {
        Some(p) if p.is_finite() && p > 0.0 => Ok(p),
        _ => Err(GatewayError::Validation("invalid buyPrice".into())),
    }
}

impl CompareRequest {
    /// Rejects bad input before any shared state is touched.
    pub fn validate(&self) -> GatewayResult<Comparison> {
        let listing = self.listing_url.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let query = self.raw_query.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let item = match (query, listing) {
            (Some(query), _) => ItemIdentity::query(query)?,
            (None, Some(listing)) => ItemIdentity::listing(listing)?,
            (None, None) => {
                return Err(GatewayError::Validation(
                    "missing listingUrl or rawQuery".into(),
                ))
            }
        };

        let buy_price = parse_buy_price(self.buy_price.as_ref())?;
        let condition = self
            .condition
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_CONDITION)
            .to_string();
        let client_id = self
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::Validation("missing clientId".into()))?
            .to_string();

        Ok(Comparison {
            item,
            buy_price,
            condition,
            client_id,
            bypass_cache: self.bypass_cache,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerySource {
    Provided,
    Resolved,
}

/// A priced comparison. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub verdict: Verdict,
    pub confidence: Confidence,
    pub market_price: f64,
    pub buy_price: f64,
    pub margin_pct: f64,
    pub sample_count: usize,
    pub why: String,
    pub query: String,
    pub query_source: QuerySource,
    pub item_identity: String,
    pub condition: String,
    pub computed_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Live,
    Cache,
    Stale,
}

/// Provenance block callers use to decide whether to retry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub used_cache: bool,
    pub used_stale_cache: bool,
    pub cooldown_remaining_sec: u64,
    pub quota_used: u32,
    pub quota_limit: u32,
    pub quota_remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl Provenance {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            source: None,
            used_cache: false,
            used_stale_cache: false,
            cooldown_remaining_sec: 0,
            quota_used: 0,
            quota_limit: 0,
            quota_remaining: 0,
            tier: None,
        }
    }
}

/// The single structured object every request gets back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_sec: Option<u64>,
    #[serde(flatten)]
    pub result: Option<ComparisonResult>,
    pub debug: Provenance,
}

impl CompareResponse {
    pub fn success(result: ComparisonResult, debug: Provenance) -> Self {
        Self {
            ok: true,
            reason: None,
            message: None,
            retry_after_sec: None,
            result: Some(result),
            debug,
        }
    }

    pub fn failure(error: &GatewayError, debug: Provenance) -> Self {
        Self {
            ok: false,
            reason: Some(error.kind()),
            message: Some(error.to_string()),
            retry_after_sec: error.retry_after_secs(),
            result: None,
            debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: serde_json::Value) -> CompareRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn item_pages_normalise_to_item_id() {
        let a = ItemIdentity::listing("https://www.ebay.com/itm/Vintage-Camera/1234567890?hash=abc").unwrap();
        let b = ItemIdentity::listing("https://ebay.com/itm/1234567890").unwrap();
        assert_eq!(a.key(), "itm:1234567890");
        assert_eq!(a.key(), b.key());

        let other = ItemIdentity::listing("https://WWW.Example.com/Shop/Item/?x=1").unwrap();
        assert_eq!(other.key(), "example.com/shop/item");
    }

    #[test]
    fn raw_queries_collapse_whitespace_and_case() {
        let q = ItemIdentity::query("  Canon   AE-1 Program ").unwrap();
        assert_eq!(q.key(), "q:canon ae-1 program");
        assert_eq!(q.display(), "Canon AE-1 Program");
    }

    #[test]
    fn buy_price_accepts_numbers_and_formatted_strings() {
        let a = request(json!({"rawQuery": "lens", "buyPrice": 250, "clientId": "c"}));
        assert_eq!(a.validate().unwrap().buy_price, 250.0);

        let b = request(json!({"rawQuery": "lens", "buyPrice": "$1,250.50", "clientId": "c"}));
        assert_eq!(b.validate().unwrap().buy_price, 1250.5);
    }

    #[test]
    fn buy_price_is_rounded_to_cents() {
        let close = request(json!({"rawQuery": "lens", "buyPrice": 99.999, "clientId": "c"}))
            .validate()
            .unwrap();
        let exact = request(json!({"rawQuery": "lens", "buyPrice": "100.00", "clientId": "c"}))
            .validate()
            .unwrap();
        assert_eq!(close.buy_price, 100.0);
        assert_eq!(close.cache_key(), exact.cache_key());

        let dust = request(json!({"rawQuery": "lens", "buyPrice": 0.004, "clientId": "c"}));
        assert_eq!(dust.validate().unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn rejects_bad_input() {
        let cases = [
            json!({"buyPrice": 10, "clientId": "c"}),
            json!({"rawQuery": "lens", "buyPrice": 0, "clientId": "c"}),
            json!({"rawQuery": "lens", "buyPrice": "free", "clientId": "c"}),
            json!({"rawQuery": "lens", "clientId": "c"}),
            json!({"listingUrl": "ftp://ebay.com/itm/1", "buyPrice": 5, "clientId": "c"}),
            json!({"rawQuery": "lens", "buyPrice": 5}),
        ];
        for body in cases {
            let err = request(body.clone()).validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{body}");
        }
    }

    #[test]
    fn cache_key_covers_identity_price_and_condition() {
        let base = request(json!({
            "itemIdentity": "https://www.ebay.com/itm/42",
            "buyPrice": 99.5,
            "clientId": "c"
        }))
        .validate()
        .unwrap();
        assert_eq!(base.condition, DEFAULT_CONDITION);
        assert_eq!(base.cache_key(), "itm:42|99.50|used");

        let mut new_condition = base.clone();
        new_condition.condition = "New".into();
        assert_ne!(base.cache_key(), new_condition.cache_key());
    }

    #[test]
    fn failure_response_carries_reason_and_retry_hint() {
        let err = GatewayError::RateLimited {
            retry_after_secs: 42,
        };
        let body = serde_json::to_value(CompareResponse::failure(
            &err,
            Provenance::new("req-1".into()),
        ))
        .unwrap();
        assert_eq!(body["ok"], json!(false));
        assert_eq!(body["reason"], json!("RATE_LIMITED"));
        assert_eq!(body["retryAfterSec"], json!(42));
        assert_eq!(body["debug"]["requestId"], json!("req-1"));
        assert!(body.get("verdict").is_none());
    }
}
