//! Ranking Policies
//!
//! Three interchangeable ways to turn a step's edges into a ranked,
//! propensity-annotated list:
//!
//! - **UCB1** (deterministic): `mean + c * sqrt(ln(N + 1) / n)`
//! - **Thompson** (stochastic): one Beta posterior draw per edge
//! - **Hybrid** (deterministic): weighted mean, uncertainty, cost and recency
//!
//! Every policy decays the pseudo-counts first, so old evidence counts for
//! less. Rankings are sorted by score descending with ties broken by tactic
//! name, truncated, and only then given propensities (normalized over the
//! returned entries).

use crate::config::EngineConfig;
use crate::decay::{decay_counts, decay_factor};
use crate::sampling::sample_beta;
use crate::types::{EdgeSnapshot, RankedTactic};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Ranking policy, resolved once at configuration time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Upper confidence bound with decayed counts
    #[default]
    #[serde(alias = "ucb")]
    Ucb1,
    /// Posterior sampling; order may differ between calls
    #[serde(alias = "ts")]
    Thompson,
    /// Weighted multi-criterion score
    Hybrid,
}

impl Policy {
    pub const ALL: [Policy; 3] = [Policy::Ucb1, Policy::Thompson, Policy::Hybrid];

    pub fn name(&self) -> &'static str {
        match self {
            Policy::Ucb1 => "ucb1",
            Policy::Thompson => "thompson",
            Policy::Hybrid => "hybrid",
        }
    }

    /// Whether two calls on identical state always return the same order
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, Policy::Thompson)
    }

    /// Rank `edges`, keep at most `limit`, and normalize propensities over
    /// what is kept
    pub fn rank(
        &self,
        edges: &[EdgeSnapshot],
        config: &EngineConfig,
        now: DateTime<Utc>,
        limit: usize,
        rng: &mut impl Rng,
    ) -> Vec<RankedTactic> {
        let ranked = self.rank_all(edges, config, now, rng);
        top_n(&ranked, limit)
    }

    /// Full ranking without truncation or propensities (used for pruning)
    pub fn rank_all(
        &self,
        edges: &[EdgeSnapshot],
        config: &EngineConfig,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> Vec<RankedTactic> {
        let mut ranked = match self {
            Policy::Ucb1 => score_ucb1(edges, config, now),
            Policy::Thompson => score_thompson(edges, config, now, rng),
            Policy::Hybrid => score_hybrid(edges, config, now),
        };
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.tactic.cmp(&b.tactic))
        });
        ranked
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ucb1" | "ucb" => Ok(Policy::Ucb1),
            "thompson" | "ts" => Ok(Policy::Thompson),
            "hybrid" => Ok(Policy::Hybrid),
            other => Err(format!(
                "unknown policy `{}` (expected ucb1, thompson or hybrid)",
                other
            )),
        }
    }
}

/// Decayed view of one edge shared by all scorers
struct DecayedArm<'a> {
    edge: &'a EdgeSnapshot,
    alpha: f64,
    beta: f64,
    factor: f64,
}

impl DecayedArm<'_> {
    fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Standard deviation of the Beta posterior
    fn uncertainty(&self) -> f64 {
        let n = self.alpha + self.beta;
        ((self.alpha * self.beta) / (n * n * (n + 1.0))).sqrt()
    }

    fn cost(&self) -> f64 {
        self.edge.cost.filter(|c| c.is_finite()).unwrap_or(0.0)
    }

    fn ranked(&self, score: f64) -> RankedTactic {
        RankedTactic {
            tactic: self.edge.tactic.clone(),
            estimated_success_probability: self.mean(),
            score: if score.is_nan() { f64::NEG_INFINITY } else { score },
            decay_factor: self.factor,
            cost: self.cost(),
            propensity: 0.0,
        }
    }
}

fn decayed_arms<'a>(
    edges: &'a [EdgeSnapshot],
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Vec<DecayedArm<'a>> {
    edges
        .iter()
        .map(|edge| {
            let factor = decay_factor(edge.last_updated, now, config.half_life_days);
            let (alpha, beta) = decay_counts(edge.alpha, edge.beta, factor);
            DecayedArm { edge, alpha, beta, factor }
        })
        .collect()
}

fn score_ucb1(edges: &[EdgeSnapshot], config: &EngineConfig, now: DateTime<Utc>) -> Vec<RankedTactic> {
    let arms = decayed_arms(edges, config, now);
    let total_plays: f64 = arms.iter().map(|a| (a.alpha + a.beta).max(1.0)).sum();
    let log_total = (total_plays + 1.0).ln();

    arms.iter()
        .map(|arm| {
            let n = (arm.alpha + arm.beta).max(1.0);
            let bonus = config.exploration_constant * (log_total / n).sqrt();
            arm.ranked(arm.mean() + bonus)
        })
        .collect()
}

fn score_thompson(
    edges: &[EdgeSnapshot],
    config: &EngineConfig,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> Vec<RankedTactic> {
    decayed_arms(edges, config, now)
        .iter()
        .map(|arm| arm.ranked(sample_beta(arm.alpha, arm.beta, &mut *rng)))
        .collect()
}

fn score_hybrid(edges: &[EdgeSnapshot], config: &EngineConfig, now: DateTime<Utc>) -> Vec<RankedTactic> {
    let w = &config.hybrid_weights;
    decayed_arms(edges, config, now)
        .iter()
        .map(|arm| {
            let score = w.exploitation * arm.mean() + w.uncertainty * arm.uncertainty()
                - w.cost * arm.cost()
                + w.recency * arm.factor;
            arm.ranked(score)
        })
        .collect()
}

/// First `limit` entries of a full ranking, with propensities over them
pub fn top_n(ranked: &[RankedTactic], limit: usize) -> Vec<RankedTactic> {
    let mut kept = ranked[..limit.min(ranked.len())].to_vec();
    assign_propensities(&mut kept);
    kept
}

/// Propensity proportional to the non-negative part of each score
///
/// Falls back to uniform when no entry has a positive finite score.
pub fn assign_propensities(ranked: &mut [RankedTactic]) {
    if ranked.is_empty() {
        return;
    }

    let weight = |score: f64| if score.is_finite() { score.max(0.0) } else { 0.0 };
    let total: f64 = ranked.iter().map(|t| weight(t.score)).sum();

    if total > 0.0 && total.is_finite() {
        for t in ranked.iter_mut() {
            t.propensity = weight(t.score) / total;
        }
    } else {
        let uniform = 1.0 / ranked.len() as f64;
        for t in ranked.iter_mut() {
            t.propensity = uniform;
        }
    }
}
