//! Recommendation Orchestrator
//!
//! `recommend(step)` is called inline by the dialogue engine before it picks
//! a tactic, so it never fails: store errors degrade to an empty
//! recommendation and the caller falls back to its own default.
//!
//! Per call:
//! 1. fetch the step's edges
//! 2. drop (and delete) edges older than the TTL
//! 3. rank with the selected policy, keep `max_recommendations`
//! 4. delete every edge outside the policy's top K (best-effort)

use crate::config::EngineConfig;
use crate::decay::{decay_counts, decay_factor};
use crate::policy::{top_n, Policy};
use crate::store::{EdgeStore, StoreResult};
use crate::types::{EdgeSnapshot, RankedTactic, RecommendOptions, Recommendation};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta, ContinuousCDF};
use tracing::{debug, info, warn};

const MS_PER_DAY: f64 = 86_400_000.0;

// ~30k years; keeps the cutoff arithmetic in range
const MAX_TTL_MS: f64 = 1e15;

/// Decayed multi-armed bandit over (step, tactic) edges
pub struct TacticEngine<S: EdgeStore> {
    pub(crate) config: EngineConfig,
    pub(crate) store: S,
}

/// Posterior summary of one edge, for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TacticStats {
    pub tactic: String,
    pub alpha: f64,
    pub beta: f64,
    pub decay_factor: f64,
    pub decayed_alpha: f64,
    pub decayed_beta: f64,
    pub mean: f64,
    pub variance: f64,
    /// 95% credible interval of the decayed posterior
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub count: i64,
    pub last_updated: Option<DateTime<Utc>>,
    pub cost: Option<f64>,
}

impl<S: EdgeStore> TacticEngine<S> {
    pub fn new(config: EngineConfig, store: S) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Ranked tactics for `step` using the engine defaults
    pub fn recommend_default(&self, step: &str) -> Recommendation {
        self.recommend(step, None, RecommendOptions::default())
    }

    /// Ranked, propensity-annotated tactics for `step`
    ///
    /// `context` is informational only and is logged at debug level.
    pub fn recommend(
        &self,
        step: &str,
        context: Option<&serde_json::Value>,
        options: RecommendOptions,
    ) -> Recommendation {
        self.recommend_at(step, context, options, Utc::now())
    }

    pub fn recommend_at(
        &self,
        step: &str,
        context: Option<&serde_json::Value>,
        options: RecommendOptions,
        now: DateTime<Utc>,
    ) -> Recommendation {
        let policy = options.policy.unwrap_or(self.config.policy);
        let limit = options
            .max_recommendations
            .unwrap_or(self.config.max_recommendations);

        if step.trim().is_empty() {
            debug!("recommend called with empty step");
            return Recommendation::empty(step, policy);
        }

        if let Some(ctx) = context {
            debug!(step, %policy, context = %ctx, "recommend");
        }

        let edges = match self.store.fetch_edges(step) {
            Ok(edges) => edges,
            Err(e) => {
                warn!(step, error = %e, "fetching edges failed, returning no recommendation");
                return Recommendation::empty(step, policy);
            }
        };

        let working = self.apply_ttl(step, edges, now);
        if working.is_empty() {
            return Recommendation::empty(step, policy);
        }

        let mut rng = rand::thread_rng();
        let ranked = policy.rank_all(&working, &self.config, now, &mut rng);
        let tactics = top_n(&ranked, limit);

        if let Err(e) = self.prune_ranked(step, &ranked) {
            warn!(step, %policy, error = %e, "top-k pruning failed");
        }

        debug!(
            step,
            %policy,
            candidates = working.len(),
            returned = tactics.len(),
            best = tactics.first().map(|t| t.tactic.as_str()).unwrap_or(""),
            "recommendation ready"
        );

        Recommendation {
            step: step.to_string(),
            policy,
            tactics,
        }
    }

    /// Re-rank every edge of `step` and delete all but the top K
    ///
    /// Returns the number of deleted edges.
    pub fn prune_top_k(&self, step: &str, policy: Policy, now: DateTime<Utc>) -> Result<usize> {
        let edges = self
            .store
            .fetch_edges(step)
            .with_context(|| format!("Failed to fetch edges for step {}", step))?;

        let mut rng = rand::thread_rng();
        let ranked = policy.rank_all(&edges, &self.config, now, &mut rng);
        let deleted = self
            .prune_ranked(step, &ranked)
            .with_context(|| format!("Failed to prune edges for step {}", step))?;
        Ok(deleted)
    }

    /// Posterior summaries for every edge of `step`, best decayed mean first
    pub fn step_stats(&self, step: &str, now: DateTime<Utc>) -> Result<Vec<TacticStats>> {
        let edges = self
            .store
            .fetch_edges(step)
            .with_context(|| format!("Failed to fetch edges for step {}", step))?;

        let mut stats: Vec<TacticStats> = edges
            .into_iter()
            .map(|edge| {
                let factor = decay_factor(edge.last_updated, now, self.config.half_life_days);
                let (a, b) = decay_counts(edge.alpha, edge.beta, factor);
                let n = a + b;
                let (ci_lower, ci_upper) = match Beta::new(a, b) {
                    Ok(dist) => (dist.inverse_cdf(0.025), dist.inverse_cdf(0.975)),
                    Err(_) => (0.0, 1.0),
                };

                TacticStats {
                    tactic: edge.tactic,
                    alpha: edge.alpha,
                    beta: edge.beta,
                    decay_factor: factor,
                    decayed_alpha: a,
                    decayed_beta: b,
                    mean: a / n,
                    variance: (a * b) / (n * n * (n + 1.0)),
                    ci_lower,
                    ci_upper,
                    count: edge.count,
                    last_updated: edge.last_updated,
                    cost: edge.cost,
                }
            })
            .collect();

        stats.sort_by(|x, y| {
            y.mean
                .partial_cmp(&x.mean)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| x.tactic.cmp(&y.tactic))
        });
        Ok(stats)
    }

    /// Oldest `last_updated` an edge may have and survive TTL pruning
    fn ttl_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.config.ttl_enabled() {
            return None;
        }
        let ttl_ms = (self.config.ttl_days * MS_PER_DAY).min(MAX_TTL_MS) as i64;
        now.checked_sub_signed(Duration::milliseconds(ttl_ms))
    }

    /// Drop expired edges from the working set and from the store
    ///
    /// A failed delete is logged; the expired edges are still excluded.
    fn apply_ttl(&self, step: &str, edges: Vec<EdgeSnapshot>, now: DateTime<Utc>) -> Vec<EdgeSnapshot> {
        let Some(cutoff) = self.ttl_cutoff(now) else {
            return edges;
        };

        let (fresh, expired): (Vec<_>, Vec<_>) = edges
            .into_iter()
            .partition(|e| e.last_updated.map_or(true, |t| t >= cutoff));

        if !expired.is_empty() {
            match self.store.delete_stale_edges(step, cutoff) {
                Ok(deleted) => info!(step, deleted, "ttl pruning removed stale edges"),
                Err(e) => warn!(step, expired = expired.len(), error = %e, "ttl pruning failed"),
            }
        }

        fresh
    }

    fn prune_ranked(&self, step: &str, ranked: &[RankedTactic]) -> StoreResult<usize> {
        let k = self.config.top_k;
        if !self.config.top_k_enabled() || ranked.len() <= k {
            return Ok(0);
        }

        let doomed: Vec<String> = ranked[k..].iter().map(|t| t.tactic.clone()).collect();
        let deleted = self.store.delete_edges(step, &doomed)?;
        info!(step, kept = k, deleted, "top-k pruning removed low-ranked edges");
        Ok(deleted)
    }
}
