//! End-to-end request flow: quota, cooldown, caches, single-flight lookups,
//! the upstream gate and pricing.

use crate::cache::TtlCache;
use crate::clock::{system_clock, to_chrono, SharedClock};
use crate::config::GatewayConfig;
use crate::cooldown::{is_rate_limit_signal, CooldownCoordinator, CooldownState};
use crate::error::{GatewayError, GatewayResult};
use crate::gate::UpstreamGate;
use crate::quota::QuotaLedger;
use crate::scrape::{derive_query, HtmlTitleResolver, TitleResolver};
use crate::search::{ComparableSearch, HttpComparableSearch, SearchOutcome};
use crate::single_flight::SingleFlight;
use crate::types::{
    CompareRequest, CompareResponse, Comparison, ComparisonResult, ItemIdentity, Provenance,
    QuerySource, Source,
};
use chrono::FixedOffset;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Snapshot served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub cooldown: CooldownState,
    pub cooldown_remaining_sec: u64,
    pub cached_results: usize,
    pub comparisons_in_flight: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub purged_results: usize,
    pub purged_usage_records: usize,
}

pub struct Gateway {
    config: GatewayConfig,
    quota: QuotaLedger,
    cooldown: CooldownCoordinator,
    results: TtlCache<String, ComparisonResult>,
    // item identity key -> derived search query
    titles: moka::future::Cache<String, String>,
    // search query -> comparable samples
    searches: moka::future::Cache<String, Arc<Vec<f64>>>,
    title_flights: SingleFlight<String, String>,
    search_flights: SingleFlight<String, Arc<Vec<f64>>>,
    compare_flights: SingleFlight<String, ComparisonResult>,
    gate: UpstreamGate,
    resolver: Arc<dyn TitleResolver>,
    search: Arc<dyn ComparableSearch>,
    clock: SharedClock,
}

impl Gateway {
    /// Must be called inside a tokio runtime; the upstream gate spawns its worker here.
    pub fn new(
        config: GatewayConfig,
        resolver: Arc<dyn TitleResolver>,
        search: Arc<dyn ComparableSearch>,
        clock: SharedClock,
        day_offset: FixedOffset,
    ) -> Arc<Self> {
        let flight_wait = config.timeouts.flight_wait;
        Arc::new(Self {
            quota: QuotaLedger::new(config.quota.clone(), day_offset, clock.clone()),
            cooldown: CooldownCoordinator::new(
                to_chrono(config.cooldown.default_duration),
                clock.clone(),
            ),
            results: TtlCache::new(config.cache.max_entries as usize, clock.clone()),
            titles: moka::future::Cache::builder()
                .max_capacity(config.cache.max_entries)
                .time_to_live(config.cache.title_ttl)
                .build(),
            searches: moka::future::Cache::builder()
                .max_capacity(config.cache.max_entries)
                .time_to_live(config.cache.search_ttl)
                .build(),
            title_flights: SingleFlight::new("title", flight_wait),
            search_flights: SingleFlight::new("search", flight_wait),
            compare_flights: SingleFlight::new("comparison", flight_wait),
            gate: UpstreamGate::new(config.gate.min_gap, config.timeouts.gate_wait),
            resolver,
            search,
            clock,
            config,
        })
    }

    /// Wires the HTTP collaborators, the system clock and the local day boundary.
    pub fn from_config(config: GatewayConfig) -> anyhow::Result<Arc<Self>> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeouts.upstream)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        let resolver = Arc::new(HtmlTitleResolver::new(http_client.clone()));
        let clock = system_clock();
        let search = Arc::new(HttpComparableSearch::new(
            http_client,
            config.upstream.clone(),
            clock.clone(),
        ));
        let day_offset = *chrono::Local::now().offset();
        Ok(Self::new(config, resolver, search, clock, day_offset))
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            cooldown: self.cooldown.state(),
            cooldown_remaining_sec: self.cooldown.remaining_secs(),
            cached_results: self.results.len(),
            comparisons_in_flight: self.compare_flights.in_flight(),
        }
    }

    /// Handles one priced-comparison request. Always produces a structured response.
    pub async fn compare(self: &Arc<Self>, request: &CompareRequest) -> CompareResponse {
        let mut provenance = Provenance::new(Uuid::new_v4().to_string());
        let outcome = match request.validate() {
            Ok(comparison) => self.run(&comparison, &mut provenance).await,
            Err(e) => Err(e),
        };
        provenance.cooldown_remaining_sec = self.cooldown.remaining_secs();

        match outcome {
            Ok(result) => CompareResponse::success(result, provenance),
            Err(e) => {
                match &e {
                    GatewayError::Internal(_) | GatewayError::Upstream(_) => {
                        warn!("comparison {} failed: {}", provenance.request_id, e)
                    }
                    _ => debug!("comparison {} refused: {}", provenance.request_id, e),
                }
                CompareResponse::failure(&e, provenance)
            }
        }
    }

    async fn run(
        self: &Arc<Self>,
        comparison: &Comparison,
        provenance: &mut Provenance,
    ) -> GatewayResult<ComparisonResult> {
        let decision = self.quota.check(&comparison.client_id);
        provenance.quota_used = decision.used;
        provenance.quota_limit = decision.limit;
        provenance.quota_remaining = decision.remaining();
        provenance.tier = Some(decision.tier);
        if !decision.allowed {
            return Err(GatewayError::LimitReached {
                used: decision.used,
                limit: decision.limit,
                retry_after_secs: decision.retry_after_secs,
            });
        }

        let key = comparison.cache_key();
        if !self.cooldown.is_open() {
            return self.degrade(&key, provenance);
        }

        if !comparison.bypass_cache {
            if let Some(hit) = self.results.get_fresh(&key) {
                debug!("fresh cache hit for {}", key);
                provenance.source = Some(Source::Cache);
                provenance.used_cache = true;
                return Ok(hit);
            }
        }

        let flight_key = if comparison.bypass_cache {
            format!("{key}|bypass")
        } else {
            key.clone()
        };
        let gateway = Arc::clone(self);
        let owned = comparison.clone();
        let live = self
            .compare_flights
            .run(flight_key, move || async move { gateway.price_live(owned).await })
            .await;

        match live {
            Ok(result) => {
                provenance.source = Some(Source::Live);
                Ok(result)
            }
            Err(GatewayError::RateLimited { .. }) => self.degrade(&key, provenance),
            Err(e) => Err(e),
        }
    }

    /// Cooldown fallback: any cached result for `key`, else a refusal with the remaining wait.
    fn degrade(&self, key: &str, provenance: &mut Provenance) -> GatewayResult<ComparisonResult> {
        match self.results.get_any(&key.to_string()) {
            Some(stale) => {
                info!("serving stale result for {} during cooldown", key);
                provenance.source = Some(Source::Stale);
                provenance.used_stale_cache = true;
                Ok(stale)
            }
            None => Err(GatewayError::RateLimited {
                retry_after_secs: self.cooldown.remaining_secs().max(1),
            }),
        }
    }

    async fn price_live(self: Arc<Self>, comparison: Comparison) -> GatewayResult<ComparisonResult> {
        let (query, query_source) = match &comparison.item {
            ItemIdentity::Query { query, .. } => (query.clone(), QuerySource::Provided),
            ItemIdentity::Listing { url, key } => {
                (self.resolve_query(key, url).await?, QuerySource::Resolved)
            }
        };

        let samples = self.fetch_samples(&query).await?;
        let pricing = self.config.pricing.price(&samples, comparison.buy_price);
        let why = if pricing.sample_count == 0 {
            format!("No sold comps found for \"{query}\"")
        } else {
            format!("Based on {} sold comps for \"{query}\"", pricing.sample_count)
        };

        let result = ComparisonResult {
            verdict: pricing.verdict,
            confidence: pricing.confidence,
            market_price: pricing.market_price,
            buy_price: comparison.buy_price,
            margin_pct: pricing.margin_pct,
            sample_count: pricing.sample_count,
            why,
            query,
            query_source,
            item_identity: comparison.item.display().to_string(),
            condition: comparison.condition.clone(),
            computed_at: self.clock.now().to_rfc3339(),
        };

        if !comparison.bypass_cache {
            self.results.set(
                comparison.cache_key(),
                result.clone(),
                to_chrono(self.config.cache.result_ttl),
            );
        }
        info!(
            "priced {} at {} ({:?}, {} comps)",
            comparison.item.key(),
            result.market_price,
            result.verdict,
            result.sample_count
        );
        Ok(result)
    }

    async fn resolve_query(self: &Arc<Self>, key: &str, url: &str) -> GatewayResult<String> {
        if let Some(query) = self.titles.get(key).await {
            debug!("title cache hit for {}", key);
            return Ok(query);
        }

        let gateway = Arc::clone(self);
        let key = key.to_string();
        let url = url.to_string();
        self.title_flights
            .run(key.clone(), move || async move {
                let resolved = tokio::time::timeout(
                    gateway.config.timeouts.upstream,
                    gateway.resolver.resolve(&url),
                )
                .await;
                let title = match resolved {
                    Ok(Ok(title)) => title,
                    Ok(Err(e)) => return Err(GatewayError::Upstream(e.to_string())),
                    Err(_) => {
                        return Err(GatewayError::Upstream(format!(
                            "title resolution timed out for {url}"
                        )))
                    }
                };
                match title.as_deref().and_then(derive_query) {
                    Some(query) => {
                        gateway.titles.insert(key, query.clone()).await;
                        Ok(query)
                    }
                    None => Err(GatewayError::NotFound(format!(
                        "could not derive a search query from {url}"
                    ))),
                }
            })
            .await
    }

    async fn fetch_samples(self: &Arc<Self>, query: &str) -> GatewayResult<Arc<Vec<f64>>> {
        if let Some(samples) = self.searches.get(query).await {
            debug!("search cache hit for query");
            return Ok(samples);
        }

        let gateway = Arc::clone(self);
        let owned = query.to_string();
        self.search_flights
            .run(query.to_string(), move || async move {
                gateway.search_upstream(owned).await
            })
            .await
    }

    async fn search_upstream(&self, query: String) -> GatewayResult<Arc<Vec<f64>>> {
        let outcome = self.gate.enqueue(|| self.call_upstream(&query)).await??;

        match outcome {
            SearchOutcome::Samples(samples) => {
                let samples = Arc::new(samples);
                self.searches.insert(query, samples.clone()).await;
                Ok(samples)
            }
            SearchOutcome::RateLimited { retry_after } => Err(self.trip(retry_after)),
            SearchOutcome::Failed { status, body } => {
                if is_rate_limit_signal(status, &body) {
                    Err(self.trip(None))
                } else {
                    Err(GatewayError::Upstream(match status {
                        Some(status) => format!("search failed with status {status}"),
                        None => "search failed".to_string(),
                    }))
                }
            }
        }
    }

    /// The last check before anything leaves the process.
    async fn call_upstream(&self, query: &str) -> GatewayResult<SearchOutcome> {
        if !self.cooldown.is_open() {
            return Err(GatewayError::RateLimited {
                retry_after_secs: self.cooldown.remaining_secs().max(1),
            });
        }
        match tokio::time::timeout(self.config.timeouts.upstream, self.search.search(query)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(GatewayError::Upstream(e.to_string())),
            Err(_) => Err(GatewayError::Upstream(format!(
                "search timed out after {:?}",
                self.config.timeouts.upstream
            ))),
        }
    }

    fn trip(&self, retry_after: Option<std::time::Duration>) -> GatewayError {
        self.cooldown.trip(retry_after.map(to_chrono));
        GatewayError::RateLimited {
            retry_after_secs: self.cooldown.remaining_secs().max(1),
        }
    }

    /// Drops stale results past the stale horizon and usage from earlier days.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            purged_results: self.results.purge(to_chrono(self.config.cache.stale_horizon)),
            purged_usage_records: self.quota.purge_stale(),
        };
        self.titles.run_pending_tasks().await;
        self.searches.run_pending_tasks().await;
        if report != MaintenanceReport::default() {
            info!(
                "maintenance purged {} results and {} usage records",
                report.purged_results, report.purged_usage_records
            );
        }
        report
    }

    /// Runs [`Gateway::run_maintenance`] periodically until the gateway is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::downgrade(self);
        let interval = self.config.maintenance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                gateway.run_maintenance().await;
            }
        })
    }
}
