//! Configuration for the cache system
//!
//! Loaded once at startup (see [`CacheConfig::from_env`]) and immutable for the
//! lifetime of a [`crate::CacheManager`].

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Eviction strategy for the bounded local tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Least recently used
    Lru,
    /// Least frequently used, ties broken by recency
    Lfu,
}

impl FromStr for EvictionStrategy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionStrategy::Lru),
            "lfu" => Ok(EvictionStrategy::Lfu),
            other => Err(CacheError::Config(format!(
                "unknown eviction strategy '{}', expected lru or lfu",
                other
            ))),
        }
    }
}

/// Per-tier storage policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Maximum number of entries (only enforced by the local tier)
    pub capacity: usize,

    /// Base time-to-live
    pub ttl_base: Duration,

    /// Absolute jitter; the effective TTL is drawn from `ttl_base ± ttl_jitter`
    pub ttl_jitter: Duration,

    pub eviction_strategy: EvictionStrategy,
}

impl TierPolicy {
    pub fn new(capacity: usize, ttl_base: Duration, ttl_jitter: Duration) -> Self {
        Self {
            capacity,
            ttl_base,
            ttl_jitter,
            eviction_strategy: EvictionStrategy::Lru,
        }
    }

    /// Calculate actual TTL with jitter applied
    ///
    /// Spreads expiry of entries written in the same instant so they do not
    /// all miss together.
    pub fn ttl_with_jitter(&self) -> Duration {
        if self.ttl_jitter.is_zero() {
            return self.ttl_base;
        }

        let base_secs = self.ttl_base.as_secs_f64();
        let jitter_range = self.ttl_jitter.as_secs_f64();
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }

    /// Longest TTL this policy can produce
    pub fn max_ttl(&self) -> Duration {
        self.ttl_base + self.ttl_jitter
    }

    fn validate(&self, tier: &str) -> Result<()> {
        if self.capacity == 0 {
            return Err(CacheError::Config(format!(
                "{} capacity must be greater than 0",
                tier
            )));
        }
        if self.ttl_base.is_zero() {
            return Err(CacheError::Config(format!(
                "{} ttl_base must be greater than 0",
                tier
            )));
        }
        if self.ttl_jitter >= self.ttl_base {
            return Err(CacheError::Config(format!(
                "{} ttl_jitter must be smaller than ttl_base",
                tier
            )));
        }
        Ok(())
    }
}

/// Which access predictor drives background refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictorKind {
    /// Decayed frequency threshold
    Heuristic,
    /// Inter-arrival model (needs the `model-predictor` feature)
    Model,
}

impl FromStr for PredictorKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "heuristic" => Ok(PredictorKind::Heuristic),
            "model" => Ok(PredictorKind::Model),
            other => Err(CacheError::Config(format!(
                "unknown predictor '{}', expected heuristic or model",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    pub kind: PredictorKind,

    /// Keys expiring within this window are refresh candidates
    pub lookahead: Duration,

    /// Minimum decayed access score for the heuristic predictor
    pub score_threshold: f64,

    /// Half-life of the exponential decay applied to access scores
    pub half_life: Duration,

    /// Number of recent access timestamps kept per key
    pub ring_capacity: usize,

    /// Records not accessed within this window are dropped
    pub gc_window: Duration,

    /// How often the sweep runs
    pub sweep_interval: Duration,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            kind: PredictorKind::Heuristic,
            lookahead: Duration::from_secs(60),
            score_threshold: 5.0,
            half_life: Duration::from_secs(300),
            ring_capacity: 32,
            gc_window: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,

    /// Time the breaker stays open before letting a probe through
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Delete retries per tier before a key is flagged possibly stale
    pub max_retries: u32,

    /// First retry delay; doubles on every attempt
    pub base_backoff: Duration,

    /// Size of the recently-seen event set
    pub dedup_capacity: usize,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(50),
            dedup_capacity: 4096,
        }
    }
}

/// Configuration for the tiered cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tier1 policy (capacity and eviction are enforced here)
    ///
    /// Its TTL is the logical freshness of a result in every tier.
    pub local: TierPolicy,

    /// Tier2 policy; its TTL is how long the backend keeps the bytes
    pub distributed: TierPolicy,

    /// Tier3 policy; its TTL is how long records are kept for cold starts
    pub durable: TierPolicy,

    /// Grace period after `expires_at` during which an entry is "stale,
    /// refreshing" rather than simply gone
    pub stale_window: Duration,

    /// Serve stale entries to foreground callers inside the stale window
    pub serve_stale: bool,

    /// Cache compute failures for this long (off when `None`)
    pub negative_ttl: Option<Duration>,

    /// Timeout for every Tier2 call
    pub distributed_timeout: Duration,

    /// Timeout for every Tier3 call
    pub durable_timeout: Duration,

    /// Default timeout for `compute_fn` when the caller supplies none
    pub compute_timeout: Option<Duration>,

    pub breaker: BreakerConfig,

    pub predictor: PredictorConfig,

    pub invalidation: InvalidationConfig,

    /// Size of the background worker pool (refreshes and fan-out)
    pub workers: usize,

    /// Enable automatic cleanup of expired local entries
    pub enable_auto_cleanup: bool,

    /// Interval for automatic cleanup checks
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local: TierPolicy::new(10_000, Duration::from_secs(300), Duration::from_secs(10)),
            distributed: TierPolicy::new(
                1_000_000,
                Duration::from_secs(3600),
                Duration::from_secs(120),
            ),
            durable: TierPolicy::new(
                usize::MAX,
                Duration::from_secs(7 * 24 * 3600),
                Duration::from_secs(3600),
            ),
            stale_window: Duration::from_secs(30),
            serve_stale: false,
            negative_ttl: None,
            distributed_timeout: Duration::from_millis(250),
            durable_timeout: Duration::from_secs(2),
            compute_timeout: Some(Duration::from_secs(120)),
            breaker: BreakerConfig::default(),
            predictor: PredictorConfig::default(),
            invalidation: InvalidationConfig::default(),
            workers: 4,
            enable_auto_cleanup: true,
            // Cleanup every 5 minutes
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// TTL stamped on a freshly computed result, shared by all its copies
    pub fn freshness_ttl(&self) -> Duration {
        self.local.ttl_with_jitter()
    }

    /// Longest any tier may still hold bytes for a result after it was written
    pub fn retention_horizon(&self) -> Duration {
        self.local
            .max_ttl()
            .max(self.distributed.max_ttl())
            .max(self.durable.max_ttl())
            + self.stale_window
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.local.validate("local")?;
        self.distributed.validate("distributed")?;
        self.durable.validate("durable")?;

        if self.workers == 0 {
            return Err(CacheError::Config(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.predictor.ring_capacity == 0 {
            return Err(CacheError::Config(
                "predictor ring_capacity must be greater than 0".to_string(),
            ));
        }

        let threshold = self.predictor.score_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(CacheError::Config(
                "predictor score_threshold must be a non-negative number".to_string(),
            ));
        }

        if self.predictor.half_life.is_zero() {
            return Err(CacheError::Config(
                "predictor half_life must be greater than 0".to_string(),
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(CacheError::Config(
                "breaker failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.invalidation.dedup_capacity == 0 {
            return Err(CacheError::Config(
                "invalidation dedup_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from the process environment
    ///
    /// A `.env` file in the working directory is honoured. Unset variables keep
    /// their defaults; malformed ones are a configuration error.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `RAG_CACHE_LOCAL_CAPACITY` | Tier1 entry limit |
    /// | `RAG_CACHE_EVICTION` | `lru` or `lfu` |
    /// | `RAG_CACHE_TTL_SECS` / `RAG_CACHE_TTL_JITTER_SECS` | freshness TTL of every result |
    /// | `RAG_CACHE_DISTRIBUTED_TTL_SECS` / `RAG_CACHE_DISTRIBUTED_TTL_JITTER_SECS` | Tier2 retention |
    /// | `RAG_CACHE_DURABLE_TTL_SECS` | Tier3 retention |
    /// | `RAG_CACHE_STALE_WINDOW_SECS`, `RAG_CACHE_SERVE_STALE` | stale-while-revalidate |
    /// | `RAG_CACHE_NEGATIVE_TTL_SECS` | enables negative caching |
    /// | `RAG_CACHE_DISTRIBUTED_TIMEOUT_MS`, `RAG_CACHE_DURABLE_TIMEOUT_MS` | tier timeouts |
    /// | `RAG_CACHE_COMPUTE_TIMEOUT_SECS` | default compute timeout |
    /// | `RAG_CACHE_BREAKER_THRESHOLD`, `RAG_CACHE_BREAKER_COOL_DOWN_SECS` | Tier2 breaker |
    /// | `RAG_CACHE_PREDICTOR`, `RAG_CACHE_LOOKAHEAD_SECS`, `RAG_CACHE_SCORE_THRESHOLD` | predictor |
    /// | `RAG_CACHE_WORKERS` | background pool size |
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = CacheConfig::default();

        if let Some(v) = env_parse::<usize>("RAG_CACHE_LOCAL_CAPACITY")? {
            config.local.capacity = v;
        }
        if let Some(v) = env_parse::<EvictionStrategy>("RAG_CACHE_EVICTION")? {
            config.local.eviction_strategy = v;
        }
        if let Some(v) = env_secs("RAG_CACHE_TTL_SECS")? {
            config.local.ttl_base = v;
        }
        if let Some(v) = env_secs("RAG_CACHE_TTL_JITTER_SECS")? {
            config.local.ttl_jitter = v;
        }
        if let Some(v) = env_secs("RAG_CACHE_DISTRIBUTED_TTL_SECS")? {
            config.distributed.ttl_base = v;
        }
        if let Some(v) = env_secs("RAG_CACHE_DISTRIBUTED_TTL_JITTER_SECS")? {
            config.distributed.ttl_jitter = v;
        }
        if let Some(v) = env_secs("RAG_CACHE_DURABLE_TTL_SECS")? {
            config.durable.ttl_base = v;
        }
        if let Some(v) = env_secs("RAG_CACHE_STALE_WINDOW_SECS")? {
            config.stale_window = v;
        }
        if let Some(v) = env_parse::<bool>("RAG_CACHE_SERVE_STALE")? {
            config.serve_stale = v;
        }
        if let Some(v) = env_secs("RAG_CACHE_NEGATIVE_TTL_SECS")? {
            config.negative_ttl = Some(v);
        }
        if let Some(v) = env_parse::<u64>("RAG_CACHE_DISTRIBUTED_TIMEOUT_MS")? {
            config.distributed_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("RAG_CACHE_DURABLE_TIMEOUT_MS")? {
            config.durable_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_secs("RAG_CACHE_COMPUTE_TIMEOUT_SECS")? {
            config.compute_timeout = Some(v);
        }
        if let Some(v) = env_parse::<u32>("RAG_CACHE_BREAKER_THRESHOLD")? {
            config.breaker.failure_threshold = v;
        }
        if let Some(v) = env_secs("RAG_CACHE_BREAKER_COOL_DOWN_SECS")? {
            config.breaker.cool_down = v;
        }
        if let Some(v) = env_parse::<PredictorKind>("RAG_CACHE_PREDICTOR")? {
            config.predictor.kind = v;
        }
        if let Some(v) = env_secs("RAG_CACHE_LOOKAHEAD_SECS")? {
            config.predictor.lookahead = v;
        }
        if let Some(v) = env_parse::<f64>("RAG_CACHE_SCORE_THRESHOLD")? {
            config.predictor.score_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("RAG_CACHE_WORKERS")? {
            config.workers = v;
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("{}={}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_secs))
}

/// Builder for cache configuration with validation
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    local_capacity: Option<usize>,
    ttl_base: Option<Duration>,
    ttl_jitter: Option<Duration>,
    eviction_strategy: Option<EvictionStrategy>,
    distributed_ttl: Option<Duration>,
    uniform_ttl: Option<(Duration, Duration)>,
    stale_window: Option<Duration>,
    serve_stale: Option<bool>,
    negative_ttl: Option<Duration>,
    distributed_timeout: Option<Duration>,
    durable_timeout: Option<Duration>,
    compute_timeout: Option<Duration>,
    breaker_failure_threshold: Option<u32>,
    breaker_cool_down: Option<Duration>,
    predictor_kind: Option<PredictorKind>,
    lookahead: Option<Duration>,
    score_threshold: Option<f64>,
    invalidation_retries: Option<u32>,
    invalidation_backoff: Option<Duration>,
    workers: Option<usize>,
    enable_auto_cleanup: Option<bool>,
}

impl CacheConfigBuilder {
    /// Set maximum number of local entries
    pub fn local_capacity(mut self, max: usize) -> Self {
        self.local_capacity = Some(max);
        self
    }

    /// Set the freshness TTL shared by every tier's copy
    pub fn ttl_base(mut self, ttl: Duration) -> Self {
        self.ttl_base = Some(ttl);
        self
    }

    /// Set absolute jitter on the freshness TTL
    pub fn ttl_jitter(mut self, jitter: Duration) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    pub fn eviction_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.eviction_strategy = Some(strategy);
        self
    }

    /// Set how long the distributed tier keeps bytes
    pub fn distributed_ttl(mut self, ttl: Duration) -> Self {
        self.distributed_ttl = Some(ttl);
        self
    }

    /// Same base TTL and jitter on every tier
    pub fn uniform_ttl(mut self, base: Duration, jitter: Duration) -> Self {
        self.uniform_ttl = Some((base, jitter));
        self
    }

    pub fn stale_window(mut self, window: Duration) -> Self {
        self.stale_window = Some(window);
        self
    }

    pub fn serve_stale(mut self, enable: bool) -> Self {
        self.serve_stale = Some(enable);
        self
    }

    pub fn negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = Some(ttl);
        self
    }

    pub fn distributed_timeout(mut self, timeout: Duration) -> Self {
        self.distributed_timeout = Some(timeout);
        self
    }

    pub fn durable_timeout(mut self, timeout: Duration) -> Self {
        self.durable_timeout = Some(timeout);
        self
    }

    pub fn compute_timeout(mut self, timeout: Duration) -> Self {
        self.compute_timeout = Some(timeout);
        self
    }

    pub fn breaker_failure_threshold(mut self, threshold: u32) -> Self {
        self.breaker_failure_threshold = Some(threshold);
        self
    }

    pub fn breaker_cool_down(mut self, cool_down: Duration) -> Self {
        self.breaker_cool_down = Some(cool_down);
        self
    }

    pub fn predictor(mut self, kind: PredictorKind) -> Self {
        self.predictor_kind = Some(kind);
        self
    }

    pub fn lookahead(mut self, window: Duration) -> Self {
        self.lookahead = Some(window);
        self
    }

    pub fn score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    pub fn invalidation_retries(mut self, retries: u32, base_backoff: Duration) -> Self {
        self.invalidation_retries = Some(retries);
        self.invalidation_backoff = Some(base_backoff);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Enable or disable automatic cleanup
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let mut config = CacheConfig::default();

        if let Some(v) = self.local_capacity {
            config.local.capacity = v;
        }
        if let Some(v) = self.ttl_base {
            config.local.ttl_base = v;
            // keep jitter below the base unless set explicitly
            if self.ttl_jitter.is_none() && config.local.ttl_jitter >= v {
                config.local.ttl_jitter = Duration::ZERO;
            }
        }
        if let Some(v) = self.ttl_jitter {
            config.local.ttl_jitter = v;
        }
        if let Some(v) = self.eviction_strategy {
            config.local.eviction_strategy = v;
        }
        if let Some(v) = self.distributed_ttl {
            config.distributed.ttl_base = v;
            if config.distributed.ttl_jitter >= v {
                config.distributed.ttl_jitter = Duration::ZERO;
            }
        }
        if let Some((base, jitter)) = self.uniform_ttl {
            for policy in [&mut config.local, &mut config.distributed, &mut config.durable] {
                policy.ttl_base = base;
                policy.ttl_jitter = jitter;
            }
        }
        config.stale_window = self.stale_window.unwrap_or(config.stale_window);
        config.serve_stale = self.serve_stale.unwrap_or(config.serve_stale);
        config.negative_ttl = self.negative_ttl.or(config.negative_ttl);
        config.distributed_timeout = self
            .distributed_timeout
            .unwrap_or(config.distributed_timeout);
        config.durable_timeout = self.durable_timeout.unwrap_or(config.durable_timeout);
        config.compute_timeout = self.compute_timeout.or(config.compute_timeout);
        config.breaker.failure_threshold = self
            .breaker_failure_threshold
            .unwrap_or(config.breaker.failure_threshold);
        config.breaker.cool_down = self.breaker_cool_down.unwrap_or(config.breaker.cool_down);
        config.predictor.kind = self.predictor_kind.unwrap_or(config.predictor.kind);
        config.predictor.lookahead = self.lookahead.unwrap_or(config.predictor.lookahead);
        config.predictor.score_threshold = self
            .score_threshold
            .unwrap_or(config.predictor.score_threshold);
        config.invalidation.max_retries = self
            .invalidation_retries
            .unwrap_or(config.invalidation.max_retries);
        config.invalidation.base_backoff = self
            .invalidation_backoff
            .unwrap_or(config.invalidation.base_backoff);
        config.workers = self.workers.unwrap_or(config.workers);
        config.enable_auto_cleanup = self
            .enable_auto_cleanup
            .unwrap_or(config.enable_auto_cleanup);

        config
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Short TTLs for corpora that are re-indexed often
    pub fn realtime() -> Self {
        let mut config = Self::default();
        config.local = TierPolicy::new(5_000, Duration::from_secs(60), Duration::from_secs(5));
        config.distributed.ttl_base = Duration::from_secs(300);
        config.distributed.ttl_jitter = Duration::from_secs(30);
        config.predictor.lookahead = Duration::from_secs(15);
        config
    }

    /// Corpora updated roughly once a day
    pub fn daily() -> Self {
        let mut config = Self::default();
        config.local = TierPolicy::new(
            50_000,
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );
        config.distributed.ttl_base = Duration::from_secs(23 * 3600);
        config.distributed.ttl_jitter = Duration::from_secs(1800);
        config.predictor.lookahead = Duration::from_secs(600);
        config
    }

    /// Configuration for memory-constrained environments
    pub fn small() -> Self {
        let mut config = Self::default();
        config.local.capacity = 1_000;
        config.workers = 1;
        config
    }

    /// Configuration for large-scale deployments
    pub fn large() -> Self {
        let mut config = Self::default();
        config.local.capacity = 1_000_000;
        config.local.eviction_strategy = EvictionStrategy::Lfu;
        config.workers = 16;
        config
    }
}
