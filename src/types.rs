//! Core types for the tactic recommendation engine
//!
//! A *step* is a point in a guided dialogue where a tactic must be chosen.
//! Each (step, tactic) pair is one Beta-Bernoulli arm, stored as an edge.

use crate::policy::Policy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current state of one (step, tactic) edge as read from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub step: String,
    pub tactic: String,

    /// Success pseudo-count (successes + 1, decayed)
    pub alpha: f64,

    /// Failure pseudo-count (failures + 1, decayed)
    pub beta: f64,

    /// Number of observed updates (diagnostic only)
    pub count: i64,

    /// Decay anchor; `None` until the first write
    pub last_updated: Option<DateTime<Utc>>,

    /// Optional penalty, only read by the hybrid policy
    pub cost: Option<f64>,
}

impl EdgeSnapshot {
    /// Fresh edge with the uniform Beta(1, 1) prior
    pub fn new(step: &str, tactic: &str) -> Self {
        Self {
            step: step.to_string(),
            tactic: tactic.to_string(),
            alpha: 1.0,
            beta: 1.0,
            count: 0,
            last_updated: None,
            cost: None,
        }
    }
}

/// One entry of a ranked recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTactic {
    pub tactic: String,

    /// Posterior mean after decay (never the Thompson draw)
    pub estimated_success_probability: f64,

    /// Policy-specific ranking score
    pub score: f64,

    pub decay_factor: f64,
    pub cost: f64,

    /// Probability of this entry under the logging policy, normalized over
    /// the returned list
    pub propensity: f64,
}

/// Ranked tactics for a step, tagged with the policy that produced them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub step: String,
    pub policy: Policy,
    pub tactics: Vec<RankedTactic>,
}

impl Recommendation {
    pub fn empty(step: &str, policy: Policy) -> Self {
        Self {
            step: step.to_string(),
            policy,
            tactics: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tactics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tactics.len()
    }

    /// Highest-ranked tactic, if any
    pub fn best(&self) -> Option<&RankedTactic> {
        self.tactics.first()
    }

    /// Propensity logged for `tactic`, if it was part of this recommendation
    pub fn propensity_of(&self, tactic: &str) -> Option<f64> {
        self.tactics
            .iter()
            .find(|t| t.tactic == tactic)
            .map(|t| t.propensity)
    }
}

/// Per-call overrides for `recommend`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendOptions {
    /// Ranking policy; engine default when `None`
    pub policy: Option<Policy>,

    /// Maximum entries returned; engine default when `None`
    pub max_recommendations: Option<usize>,
}

impl RecommendOptions {
    pub fn with_policy(policy: Policy) -> Self {
        Self {
            policy: Some(policy),
            ..Default::default()
        }
    }
}

/// Outcome report from the reflection service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    /// Lead / session the decision belongs to
    pub conversation_id: String,
    pub step: String,

    /// The tactic that was actually executed
    pub tactic: String,
    pub success: bool,

    /// Recommendation that was shown when the tactic was chosen
    #[serde(default)]
    pub recommendation: Option<Recommendation>,

    /// Tactic name -> non-negative credit; full credit to `tactic` when absent
    #[serde(default)]
    pub eligibility: Option<HashMap<String, f64>>,
}

impl Outcome {
    pub fn new(conversation_id: &str, step: &str, tactic: &str, success: bool) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            step: step.to_string(),
            tactic: tactic.to_string(),
            success,
            recommendation: None,
            eligibility: None,
        }
    }

    pub fn with_recommendation(mut self, recommendation: Recommendation) -> Self {
        self.recommendation = Some(recommendation);
        self
    }

    pub fn with_eligibility(mut self, eligibility: HashMap<String, f64>) -> Self {
        self.eligibility = Some(eligibility);
        self
    }
}

/// Recommendation entry as captured in a decision record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedTactic {
    pub tactic: String,
    pub estimated_success_probability: f64,
    pub propensity: f64,
}

impl From<&RankedTactic> for LoggedTactic {
    fn from(t: &RankedTactic) -> Self {
        Self {
            tactic: t.tactic.clone(),
            estimated_success_probability: t.estimated_success_probability,
            propensity: t.propensity,
        }
    }
}

/// Append-only log entry for off-policy evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub conversation_id: String,
    pub step: String,
    pub tactic: String,
    pub success: bool,

    /// `None` when the decision was not made from a tracked recommendation
    pub policy: Option<Policy>,

    /// `None` marks an untracked decision (e.g. operator override); such
    /// records are excluded from propensity-weighted evaluation
    pub propensity: Option<f64>,

    /// Snapshot of the recommendation's tactic list at decision time
    pub recommendation: Vec<LoggedTactic>,

    pub created_at: DateTime<Utc>,
}
