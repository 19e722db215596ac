//! Gateway configuration: defaults overlaid with environment variables.

use crate::auth::ClientCredentials;
use crate::pricing::PricingPolicy;
use anyhow::{anyhow, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Fresh horizon of a priced comparison.
    pub result_ttl: Duration,
    /// How long past expiry a comparison may still be served as stale.
    pub stale_horizon: Duration,
    pub title_ttl: Duration,
    pub search_ttl: Duration,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(60 * 60),
            stale_horizon: Duration::from_secs(24 * 60 * 60),
            title_ttl: Duration::from_secs(60 * 30),
            search_ttl: Duration::from_secs(60 * 10),
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub min_gap: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_gap: Duration::from_millis(1_100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CooldownConfig {
    /// Used when the upstream gives no retry hint.
    pub default_duration: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaConfig {
    pub default_limit: u32,
    pub privileged_limit: u32,
    pub privileged_clients: Vec<String>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            privileged_limit: 50,
            privileged_clients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Bound on a single outbound collaborator call.
    pub upstream: Duration,
    /// Bound on waiting for a slot in the upstream queue.
    pub gate_wait: Duration,
    /// Bound on waiting for a shared in-flight computation.
    pub flight_wait: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream: Duration::from_secs(15),
            gate_wait: Duration::from_secs(30),
            flight_wait: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub search_url: String,
    /// Static bearer token; takes precedence over client credentials.
    pub api_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: String,
    pub token_scope: String,
    pub marketplace_id: String,
    pub result_limit: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            search_url: "https://api.ebay.com/buy/browse/v1/item_summary/search".to_string(),
            api_token: None,
            client_id: None,
            client_secret: None,
            token_url: "https://api.ebay.com/identity/v1/oauth2/token".to_string(),
            token_scope: "https://api.ebay.com/oauth/api_scope".to_string(),
            marketplace_id: "EBAY_US".to_string(),
            result_limit: 20,
        }
    }
}

impl UpstreamConfig {
    /// Client-credentials grant settings, when both halves are configured.
    pub fn credentials(&self) -> Option<ClientCredentials> {
        Some(ClientCredentials {
            client_id: self.client_id.clone()?,
            client_secret: self.client_secret.clone()?,
            token_url: self.token_url.clone(),
            scope: self.token_scope.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub cache: CacheConfig,
    pub gate: GateConfig,
    pub cooldown: CooldownConfig,
    pub quota: QuotaConfig,
    pub pricing: PricingPolicy,
    pub timeouts: TimeoutConfig,
    pub upstream: UpstreamConfig,
    pub maintenance_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            cache: CacheConfig::default(),
            gate: GateConfig::default(),
            cooldown: CooldownConfig::default(),
            quota: QuotaConfig::default(),
            pricing: PricingPolicy::default(),
            timeouts: TimeoutConfig::default(),
            upstream: UpstreamConfig::default(),
            maintenance_interval: Duration::from_secs(5 * 60),
        }
    }
}

fn parse_u64(raw: &str, name: &str, issues: &mut Vec<String>) -> Option<u64> {
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            issues.push(format!("{name} must be a non-negative integer, got {raw:?}"));
            None
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from any variable source; every invalid value is reported at once.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let mut issues: Vec<String> = Vec::new();

        let secs = |name: &str, issues: &mut Vec<String>| {
            lookup(name)
                .and_then(|raw| parse_u64(&raw, name, issues))
                .map(Duration::from_secs)
        };

        if let Some(v) = lookup("GATEWAY_BIND") {
            config.bind_addr = v;
        }
        if let Some(v) = lookup("COMPS_SEARCH_URL") {
            config.upstream.search_url = v;
        }
        config.upstream.api_token = lookup("COMPS_API_TOKEN").filter(|t| !t.trim().is_empty());
        config.upstream.client_id = lookup("COMPS_CLIENT_ID").filter(|v| !v.trim().is_empty());
        config.upstream.client_secret =
            lookup("COMPS_CLIENT_SECRET").filter(|v| !v.trim().is_empty());
        if let Some(v) = lookup("COMPS_TOKEN_URL") {
            config.upstream.token_url = v;
        }
        if let Some(v) = lookup("COMPS_TOKEN_SCOPE") {
            config.upstream.token_scope = v;
        }
        if let Some(v) = lookup("COMPS_MARKETPLACE_ID") {
            config.upstream.marketplace_id = v;
        }

        if let Some(v) = secs("RESULT_TTL_SECS", &mut issues) {
            config.cache.result_ttl = v;
        }
        if let Some(v) = secs("STALE_HORIZON_SECS", &mut issues) {
            config.cache.stale_horizon = v;
        }
        if let Some(v) = secs("TITLE_TTL_SECS", &mut issues) {
            config.cache.title_ttl = v;
        }
        if let Some(v) = secs("SEARCH_TTL_SECS", &mut issues) {
            config.cache.search_ttl = v;
        }
        if let Some(v) = lookup("CACHE_MAX_ENTRIES").and_then(|raw| parse_u64(&raw, "CACHE_MAX_ENTRIES", &mut issues)) {
            config.cache.max_entries = v;
        }
        if let Some(v) = lookup("UPSTREAM_MIN_GAP_MS").and_then(|raw| parse_u64(&raw, "UPSTREAM_MIN_GAP_MS", &mut issues)) {
            config.gate.min_gap = Duration::from_millis(v);
        }
        if let Some(v) = secs("COOLDOWN_DEFAULT_SECS", &mut issues) {
            config.cooldown.default_duration = v;
        }
        if let Some(v) = lookup("QUOTA_DEFAULT_LIMIT").and_then(|raw| parse_u64(&raw, "QUOTA_DEFAULT_LIMIT", &mut issues)) {
            config.quota.default_limit = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = lookup("QUOTA_PRIVILEGED_LIMIT").and_then(|raw| parse_u64(&raw, "QUOTA_PRIVILEGED_LIMIT", &mut issues)) {
            config.quota.privileged_limit = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = lookup("QUOTA_PRIVILEGED_CLIENTS") {
            config.quota.privileged_clients = parse_list(&v);
        }
        if let Some(v) = secs("UPSTREAM_TIMEOUT_SECS", &mut issues) {
            config.timeouts.upstream = v;
        }
        if let Some(v) = secs("GATE_WAIT_TIMEOUT_SECS", &mut issues) {
            config.timeouts.gate_wait = v;
        }
        if let Some(v) = secs("FLIGHT_WAIT_TIMEOUT_SECS", &mut issues) {
            config.timeouts.flight_wait = v;
        }
        if let Some(v) = secs("MAINTENANCE_INTERVAL_SECS", &mut issues) {
            config.maintenance_interval = v;
        }

        issues.extend(config.validate());
        if !issues.is_empty() {
            return Err(anyhow!("invalid configuration: {}", issues.join("; ")));
        }
        Ok(config)
    }

    fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.cache.max_entries == 0 {
            issues.push("CACHE_MAX_ENTRIES must be > 0".to_string());
        }
        if self.timeouts.upstream.is_zero() {
            issues.push("UPSTREAM_TIMEOUT_SECS must be > 0".to_string());
        }
        if self.timeouts.gate_wait.is_zero() {
            issues.push("GATE_WAIT_TIMEOUT_SECS must be > 0".to_string());
        }
        if self.timeouts.flight_wait.is_zero() {
            issues.push("FLIGHT_WAIT_TIMEOUT_SECS must be > 0".to_string());
        }
        if self.maintenance_interval.is_zero() {
            issues.push("MAINTENANCE_INTERVAL_SECS must be > 0".to_string());
        }
        if !self.upstream.search_url.starts_with("http://")
            && !self.upstream.search_url.starts_with("https://")
        {
            issues.push("COMPS_SEARCH_URL must start with http:// or https://".to_string());
        }
        if self.upstream.client_id.is_some() != self.upstream.client_secret.is_some() {
            issues.push("COMPS_CLIENT_ID and COMPS_CLIENT_SECRET must be set together".to_string());
        }
        if !self.upstream.token_url.starts_with("http://")
            && !self.upstream.token_url.starts_with("https://")
        {
            issues.push("COMPS_TOKEN_URL must start with http:// or https://".to_string());
        }
        issues
    }
}
