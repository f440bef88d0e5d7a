//! Access-pattern tracking and refresh prediction
//!
//! Every lookup records a timestamp for its key. Periodically the sweep asks
//! the active [`AccessPredictor`] which soon-to-expire local entries are worth
//! recomputing before they lapse.
//!
//! Two predictors exist:
//!
//! - [`HeuristicPredictor`]: exponentially decayed access count against a
//!   threshold. Always available.
//! - `ModelPredictor`: estimates the next access from mean inter-arrival time.
//!   Compiled with the `model-predictor` feature; when the feature is off a
//!   configured model falls back to the heuristic with a warning.

use crate::clock::chrono_duration;
use crate::config::{PredictorConfig, PredictorKind};
use crate::entry::CacheEntry;
use crate::key::CacheKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::time::Duration;
use tracing::debug;

/// Recent access history of one key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPatternRecord {
    pub key: String,

    /// Bounded ring of recent access times, oldest first
    pub recent_access_timestamps: VecDeque<DateTime<Utc>>,

    /// Decayed access count as of `last_scored_at`
    pub frequency_score: f64,

    pub last_scored_at: DateTime<Utc>,
}

impl AccessPatternRecord {
    pub fn new(key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            recent_access_timestamps: VecDeque::new(),
            frequency_score: 0.0,
            last_scored_at: now,
        }
    }

    /// Decay the score to `now`, then count one access
    pub fn record(&mut self, now: DateTime<Utc>, half_life: Duration, ring_capacity: usize) {
        self.frequency_score = self.decayed_score(now, half_life) + 1.0;
        self.last_scored_at = self.last_scored_at.max(now);

        self.recent_access_timestamps.push_back(now);
        while self.recent_access_timestamps.len() > ring_capacity {
            self.recent_access_timestamps.pop_front();
        }
    }

    /// Score as it would read at `now`
    pub fn decayed_score(&self, now: DateTime<Utc>, half_life: Duration) -> f64 {
        let elapsed = (now - self.last_scored_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        let half_life = half_life.as_secs_f64().max(f64::EPSILON);
        self.frequency_score * 0.5f64.powf(elapsed / half_life)
    }

    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        self.recent_access_timestamps.back().copied()
    }

    /// Mean gap between consecutive recorded accesses
    pub fn mean_inter_arrival(&self) -> Option<Duration> {
        let first = self.recent_access_timestamps.front()?;
        let last = self.recent_access_timestamps.back()?;
        let gaps = self.recent_access_timestamps.len().checked_sub(1)?;
        if gaps == 0 {
            return None;
        }
        let span = (*last - *first).to_std().ok()?;
        Some(span / gaps as u32)
    }
}

/// Decides whether an entry deserves a background refresh
pub trait AccessPredictor: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn should_refresh(
        &self,
        record: &AccessPatternRecord,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool;
}

/// Refresh keys whose decayed access score clears a threshold
#[derive(Debug, Clone)]
pub struct HeuristicPredictor {
    pub threshold: f64,
    pub half_life: Duration,
}

impl HeuristicPredictor {
    pub fn new(threshold: f64, half_life: Duration) -> Self {
        Self {
            threshold,
            half_life,
        }
    }
}

impl AccessPredictor for HeuristicPredictor {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn should_refresh(
        &self,
        record: &AccessPatternRecord,
        _expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        record.decayed_score(now, self.half_life) >= self.threshold
    }
}

/// Refresh keys whose next access is expected shortly after expiry
///
/// The next access is estimated as `last access + mean inter-arrival gap`.
/// Keys with too little history defer to the heuristic.
#[cfg(feature = "model-predictor")]
#[derive(Debug, Clone)]
pub struct ModelPredictor {
    /// Minimum recorded accesses before the model is trusted
    pub min_samples: usize,

    /// How far past expiry a predicted access still justifies a refresh
    pub horizon: Duration,

    pub fallback: HeuristicPredictor,
}

#[cfg(feature = "model-predictor")]
impl ModelPredictor {
    pub fn new(horizon: Duration, fallback: HeuristicPredictor) -> Self {
        Self {
            min_samples: 3,
            horizon,
            fallback,
        }
    }
}

#[cfg(feature = "model-predictor")]
impl AccessPredictor for ModelPredictor {
    fn name(&self) -> &'static str {
        "model"
    }

    fn should_refresh(
        &self,
        record: &AccessPatternRecord,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if record.recent_access_timestamps.len() < self.min_samples {
            return self.fallback.should_refresh(record, expires_at, now);
        }
        let (gap, last) = match (record.mean_inter_arrival(), record.last_access()) {
            (Some(gap), Some(last)) => (gap, last),
            _ => return self.fallback.should_refresh(record, expires_at, now),
        };

        let gap = chrono_duration(gap);
        // a key silent for several gaps has gone cold
        if now - last > gap * 3 {
            return false;
        }

        let expected_next = (last + gap).max(now);
        expected_next <= expires_at + chrono_duration(self.horizon)
    }
}

/// Build the predictor named by the configuration
pub fn build_predictor(config: &PredictorConfig) -> Box<dyn AccessPredictor> {
    let heuristic = HeuristicPredictor::new(config.score_threshold, config.half_life);
    match config.kind {
        PredictorKind::Heuristic => Box::new(heuristic),
        #[cfg(feature = "model-predictor")]
        PredictorKind::Model => Box::new(ModelPredictor::new(config.lookahead, heuristic)),
        #[cfg(not(feature = "model-predictor"))]
        PredictorKind::Model => {
            tracing::warn!("Model predictor requested but the model-predictor feature is disabled; using heuristic");
            Box::new(heuristic)
        }
    }
}

/// Tracks access records and picks refresh candidates
#[derive(Debug)]
pub struct AccessTracker {
    records: DashMap<String, AccessPatternRecord>,
    predictor: Box<dyn AccessPredictor>,
    config: PredictorConfig,
}

impl AccessTracker {
    pub fn new(config: PredictorConfig) -> Self {
        let predictor = build_predictor(&config);
        Self::with_predictor(config, predictor)
    }

    pub fn with_predictor(config: PredictorConfig, predictor: Box<dyn AccessPredictor>) -> Self {
        debug!("Access tracker using {} predictor", predictor.name());
        Self {
            records: DashMap::new(),
            predictor,
            config,
        }
    }

    pub fn predictor_name(&self) -> &'static str {
        self.predictor.name()
    }

    pub fn lookahead(&self) -> Duration {
        self.config.lookahead
    }

    /// Count one access to `fingerprint`
    pub fn record_access(&self, fingerprint: &str, now: DateTime<Utc>) {
        let half_life = self.config.half_life;
        let ring = self.config.ring_capacity;
        self.records
            .entry(fingerprint.to_string())
            .or_insert_with(|| AccessPatternRecord::new(fingerprint, now))
            .record(now, half_life, ring);
    }

    pub fn record(&self, fingerprint: &str) -> Option<AccessPatternRecord> {
        self.records.get(fingerprint).map(|r| r.value().clone())
    }

    /// Keys among `expiring` the predictor wants refreshed
    pub fn candidates(&self, expiring: &[CacheEntry], now: DateTime<Utc>) -> Vec<CacheKey> {
        expiring
            .iter()
            .filter(|entry| {
                self.records
                    .get(entry.fingerprint())
                    .map(|record| self.predictor.should_refresh(&record, entry.expires_at, now))
                    .unwrap_or(false)
            })
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Drop records with no access inside the GC window
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono_duration(self.config.gc_window);
        let before = self.records.len();
        self.records
            .retain(|_, record| record.last_access().map(|t| t >= cutoff).unwrap_or(false));
        before.saturating_sub(self.records.len())
    }

    pub fn forget(&self, fingerprint: &str) {
        self.records.remove(fingerprint);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CacheKeyBuilder;
    use crate::types::{DocumentRef, TierKind};

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_score_decays_by_half_life() {
        let t0 = Utc::now();
        let half_life = Duration::from_secs(60);
        let mut record = AccessPatternRecord::new("k", t0);
        record.record(t0, half_life, 8);
        record.record(t0, half_life, 8);

        assert!((record.decayed_score(t0, half_life) - 2.0).abs() < 1e-9);
        assert!((record.decayed_score(t0 + secs(60), half_life) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ring_is_bounded() {
        let t0 = Utc::now();
        let mut record = AccessPatternRecord::new("k", t0);
        for i in 0..10 {
            record.record(t0 + secs(i), Duration::from_secs(60), 4);
        }
        assert_eq!(record.recent_access_timestamps.len(), 4);
        assert_eq!(record.last_access(), Some(t0 + secs(9)));
        assert_eq!(record.mean_inter_arrival(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_heuristic_threshold() {
        let t0 = Utc::now();
        let predictor = HeuristicPredictor::new(3.0, Duration::from_secs(300));
        let mut record = AccessPatternRecord::new("k", t0);
        record.record(t0, predictor.half_life, 8);
        record.record(t0, predictor.half_life, 8);
        assert!(!predictor.should_refresh(&record, t0, t0));

        record.record(t0, predictor.half_life, 8);
        assert!(predictor.should_refresh(&record, t0, t0));
        // an hour later the key has cooled off
        assert!(!predictor.should_refresh(&record, t0, t0 + secs(3600)));
    }

    #[cfg(feature = "model-predictor")]
    #[test]
    fn test_model_predicts_next_access() {
        let t0 = Utc::now();
        let predictor = ModelPredictor::new(
            Duration::from_secs(10),
            HeuristicPredictor::new(100.0, Duration::from_secs(300)),
        );
        let mut record = AccessPatternRecord::new("k", t0);
        for i in 0..4 {
            record.record(t0 + secs(i * 20), Duration::from_secs(300), 8);
        }
        let now = t0 + secs(65);

        // next access expected at t0+80
        assert!(predictor.should_refresh(&record, t0 + secs(75), now));
        assert!(!predictor.should_refresh(&record, t0 + secs(60) - secs(5), t0 + secs(50)));

        // long silence means the key went cold
        assert!(!predictor.should_refresh(&record, t0 + secs(1000), t0 + secs(900)));
    }

    #[test]
    fn test_tracker_candidates_and_gc() {
        let t0 = Utc::now();
        let config = PredictorConfig {
            score_threshold: 2.0,
            gc_window: Duration::from_secs(600),
            ..PredictorConfig::default()
        };
        let tracker = AccessTracker::with_predictor(
            config.clone(),
            Box::new(HeuristicPredictor::new(config.score_threshold, config.half_life)),
        );

        let builder = CacheKeyBuilder::answers("m");
        let docs = [DocumentRef::new("d1", "h1")];
        let hot = builder.build("hot", &docs).unwrap();
        let cold = builder.build("cold", &docs).unwrap();

        for _ in 0..3 {
            tracker.record_access(hot.fingerprint(), t0);
        }
        tracker.record_access(cold.fingerprint(), t0);

        let expiring: Vec<CacheEntry> = [hot.clone(), cold]
            .into_iter()
            .map(|k| CacheEntry::new(k, vec![], TierKind::Local, t0, t0, Duration::from_secs(30)))
            .collect();

        let picked = tracker.candidates(&expiring, t0);
        assert_eq!(picked, vec![hot]);

        assert_eq!(tracker.gc(t0 + secs(601)), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_build_predictor_kinds() {
        let heuristic = build_predictor(&PredictorConfig::default());
        assert_eq!(heuristic.name(), "heuristic");

        let model = build_predictor(&PredictorConfig {
            kind: PredictorKind::Model,
            ..PredictorConfig::default()
        });
        if cfg!(feature = "model-predictor") {
            assert_eq!(model.name(), "model");
        } else {
            assert_eq!(model.name(), "heuristic");
        }
    }
}
