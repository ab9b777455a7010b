//! Outcome Recording - closing the learning loop
//!
//! When the reflection service decides whether a tactic worked, this module:
//! 1. Splits one unit of credit across the tactics that contributed
//!    (eligibility trace; full credit to the executed tactic by default)
//! 2. Decays each credited edge and adds its share to alpha or beta
//! 3. Appends an immutable decision record for off-policy evaluation
//!
//! Updates are best-effort. A failed update is logged and dropped; the
//! conversation that produced it carries on. Retrying an update after an
//! ambiguous failure can double-count, so callers should not retry blindly.

use crate::decay::{decay_counts, decay_factor};
use crate::engine::TacticEngine;
use crate::store::EdgeStore;
use crate::types::{DecisionRecord, LoggedTactic, Outcome};
use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use uuid::Uuid;

/// How one credited edge moved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditAdjustment {
    pub tactic: String,
    pub credit: f64,
    pub decay_factor: f64,
    pub decayed_alpha: f64,
    pub decayed_beta: f64,
    pub new_alpha: f64,
    pub new_beta: f64,
}

impl CreditAdjustment {
    /// Evidence added by this update (equals `credit`)
    pub fn delta(&self) -> f64 {
        (self.new_alpha - self.decayed_alpha) + (self.new_beta - self.decayed_beta)
    }
}

/// Result of a successful outcome update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeResult {
    pub decision_id: String,
    pub adjustments: Vec<CreditAdjustment>,
    /// Propensity logged for the executed tactic, if it was recommended
    pub propensity: Option<f64>,
}

/// Normalize an eligibility map to credits summing to 1.0
///
/// Non-finite, non-positive and blank-named entries are dropped. If nothing
/// is left the executed `tactic` gets full credit. Output is sorted by name.
pub fn normalize_eligibility(
    eligibility: Option<&HashMap<String, f64>>,
    tactic: &str,
) -> Vec<(String, f64)> {
    let valid: BTreeMap<&str, f64> = eligibility
        .into_iter()
        .flatten()
        .filter(|(name, credit)| !name.trim().is_empty() && credit.is_finite() && **credit > 0.0)
        .map(|(name, credit)| (name.as_str(), *credit))
        .collect();

    let total: f64 = valid.values().sum();
    if valid.is_empty() || !total.is_finite() || total <= 0.0 {
        return vec![(tactic.to_string(), 1.0)];
    }

    valid
        .into_iter()
        .map(|(name, credit)| (name.to_string(), credit / total))
        .collect()
}

impl<S: EdgeStore> TacticEngine<S> {
    /// Learn from an outcome; never fails the caller
    pub fn update_after_outcome(&self, outcome: &Outcome) {
        self.update_after_outcome_at(outcome, Utc::now());
    }

    pub fn update_after_outcome_at(&self, outcome: &Outcome, now: DateTime<Utc>) {
        if let Err(e) = self.try_update_after_outcome_at(outcome, now) {
            warn!(
                conversation = %outcome.conversation_id,
                step = %outcome.step,
                tactic = %outcome.tactic,
                error = %format!("{:#}", e),
                "outcome update dropped"
            );
        }
    }

    /// Fallible core of [`Self::update_after_outcome`], exposing the
    /// per-tactic adjustments
    pub fn try_update_after_outcome_at(
        &self,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<OutcomeResult> {
        ensure!(!outcome.step.trim().is_empty(), "outcome has an empty step");
        ensure!(!outcome.tactic.trim().is_empty(), "outcome has an empty tactic");

        let step = outcome.step.as_str();

        // 1. The executed tactic always gets an edge, credited or not
        self.store
            .ensure_edge(step, &outcome.tactic)
            .with_context(|| format!("Failed to ensure edge {} -> {}", step, outcome.tactic))?;

        // 2. Credit split
        let credits = normalize_eligibility(outcome.eligibility.as_ref(), &outcome.tactic);

        // 3. Decayed Bayesian update per credited tactic
        let mut adjustments = Vec::with_capacity(credits.len());
        for (tactic, credit) in credits {
            let edge = self
                .store
                .ensure_edge(step, &tactic)
                .with_context(|| format!("Failed to ensure edge {} -> {}", step, tactic))?;

            let factor = decay_factor(edge.last_updated, now, self.config.half_life_days);
            let (decayed_alpha, decayed_beta) = decay_counts(edge.alpha, edge.beta, factor);
            let (new_alpha, new_beta) = if outcome.success {
                (decayed_alpha + credit, decayed_beta)
            } else {
                (decayed_alpha, decayed_beta + credit)
            };

            self.store
                .write_edge(step, &tactic, new_alpha, new_beta, now)
                .with_context(|| format!("Failed to write edge {} -> {}", step, tactic))?;

            debug!(
                step,
                tactic = %tactic,
                credit,
                success = outcome.success,
                new_alpha,
                new_beta,
                "edge updated"
            );

            adjustments.push(CreditAdjustment {
                tactic,
                credit,
                decay_factor: factor,
                decayed_alpha,
                decayed_beta,
                new_alpha,
                new_beta,
            });
        }

        // 4. Decision record, propensity taken from what was shown
        let recommendation = outcome.recommendation.as_ref();
        let propensity = recommendation.and_then(|r| r.propensity_of(&outcome.tactic));
        let record = DecisionRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: outcome.conversation_id.clone(),
            step: outcome.step.clone(),
            tactic: outcome.tactic.clone(),
            success: outcome.success,
            policy: recommendation.map(|r| r.policy),
            propensity,
            recommendation: recommendation
                .map(|r| r.tactics.iter().map(LoggedTactic::from).collect())
                .unwrap_or_default(),
            created_at: now,
        };

        if propensity.is_none() {
            debug!(step, tactic = %outcome.tactic, "untracked decision, no propensity logged");
        }

        self.store
            .append_decision(&record)
            .context("Failed to append decision record")?;

        Ok(OutcomeResult {
            decision_id: record.id,
            adjustments,
            propensity,
        })
    }

    /// Summary of the decision log for `step`
    pub fn learning_stats(&self, step: &str) -> Result<LearningStats> {
        let records = self
            .store
            .decisions_for_step(step)
            .with_context(|| format!("Failed to load decisions for step {}", step))?;
        Ok(LearningStats::from_records(step, &records))
    }
}

/// Outcome counts for one tactic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TacticOutcomes {
    pub tactic: String,
    pub decisions: usize,
    pub successes: usize,
}

/// Learning statistics summary for one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningStats {
    pub step: String,
    pub total_decisions: usize,
    pub successful_decisions: usize,
    pub success_rate: f64,

    /// Decisions carrying a logged propensity
    pub tracked_decisions: usize,
    /// Decisions made outside a tracked recommendation
    pub untracked_decisions: usize,

    /// Self-normalized IPS estimate of the success rate had the tactic been
    /// picked uniformly from each logged recommendation
    pub uniform_policy_estimate: Option<f64>,

    pub by_tactic: Vec<TacticOutcomes>,
}

impl LearningStats {
    pub fn from_records(step: &str, records: &[DecisionRecord]) -> Self {
        let total = records.len();
        let successes = records.iter().filter(|r| r.success).count();
        let tracked = records.iter().filter(|r| r.propensity.is_some()).count();

        let mut weighted_reward = 0.0;
        let mut weight_sum = 0.0;
        for record in records {
            let Some(p) = record.propensity.filter(|p| *p > 0.0 && p.is_finite()) else {
                continue;
            };
            if record.recommendation.is_empty() {
                continue;
            }
            let target = 1.0 / record.recommendation.len() as f64;
            let w = target / p;
            weight_sum += w;
            if record.success {
                weighted_reward += w;
            }
        }

        let mut counts: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for record in records {
            let entry = counts.entry(record.tactic.as_str()).or_default();
            entry.0 += 1;
            if record.success {
                entry.1 += 1;
            }
        }
        let mut by_tactic: Vec<TacticOutcomes> = counts
            .into_iter()
            .map(|(tactic, (decisions, successes))| TacticOutcomes {
                tactic: tactic.to_string(),
                decisions,
                successes,
            })
            .collect();
        by_tactic.sort_by(|a, b| b.decisions.cmp(&a.decisions).then_with(|| a.tactic.cmp(&b.tactic)));

        Self {
            step: step.to_string(),
            total_decisions: total,
            successful_decisions: successes,
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                0.0
            },
            tracked_decisions: tracked,
            untracked_decisions: total - tracked,
            uniform_policy_estimate: (weight_sum > 0.0).then(|| weighted_reward / weight_sum),
            by_tactic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::policy::Policy;
    use crate::store::{SqliteEdgeStore, StoreResult};
    use crate::types::{EdgeSnapshot, RecommendOptions};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000).unwrap()
    }

    fn engine() -> TacticEngine<SqliteEdgeStore> {
        TacticEngine::new(EngineConfig::without_ttl(), SqliteEdgeStore::open_in_memory().unwrap())
    }

    fn credits(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_normalize_defaults_to_full_credit() {
        assert_eq!(normalize_eligibility(None, "t"), vec![("t".to_string(), 1.0)]);
        assert_eq!(
            normalize_eligibility(Some(&HashMap::new()), "t"),
            vec![("t".to_string(), 1.0)]
        );
        let degenerate = credits(&[("a", 0.0), ("b", -2.0), ("c", f64::NAN), ("  ", 4.0)]);
        assert_eq!(normalize_eligibility(Some(&degenerate), "t"), vec![("t".to_string(), 1.0)]);
    }

    #[test]
    fn test_normalize_splits_credit() {
        let split = normalize_eligibility(Some(&credits(&[("b", 1.0), ("a", 3.0), ("z", 0.0)])), "a");
        assert_eq!(split, vec![("a".to_string(), 0.75), ("b".to_string(), 0.25)]);
    }

    #[test]
    fn test_update_from_uniform_prior() {
        let engine = engine();
        engine.store.write_edge("Discovery", "OpenQuestion", 1.0, 1.0, now()).unwrap();

        let outcome = Outcome::new("lead-1", "Discovery", "OpenQuestion", true)
            .with_eligibility(credits(&[("OpenQuestion", 1.0)]));
        engine.try_update_after_outcome_at(&outcome, now()).unwrap();

        let edge = engine.store.fetch_edge("Discovery", "OpenQuestion").unwrap().unwrap();
        assert_eq!(edge.alpha, 2.0);
        assert_eq!(edge.beta, 1.0);
        assert_eq!(edge.count, 2);
    }

    #[test]
    fn test_failure_increments_beta_on_new_edge() {
        let engine = engine();
        let outcome = Outcome::new("lead-1", "Pitch", "CaseStudy", false);
        engine.update_after_outcome_at(&outcome, now());

        let edge = engine.store.fetch_edge("Pitch", "CaseStudy").unwrap().unwrap();
        assert_eq!((edge.alpha, edge.beta), (1.0, 2.0));
        assert_eq!(edge.last_updated, Some(now()));
    }

    #[test]
    fn test_update_decays_before_adding() {
        let engine = engine();
        engine
            .store
            .write_edge("S", "t", 4.0, 2.0, now() - Duration::days(7))
            .unwrap();

        let result = engine
            .try_update_after_outcome_at(&Outcome::new("c", "S", "t", true), now())
            .unwrap();
        let adj = &result.adjustments[0];
        assert!((adj.decay_factor - 0.5).abs() < 1e-12);
        assert!((adj.new_alpha - 3.0).abs() < 1e-12);
        assert!((adj.new_beta - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_credit_sums_to_one() {
        let engine = engine();
        for (tactic, a, b) in [("a", 5.0, 2.0), ("b", 1.0, 1.0)] {
            engine
                .store
                .write_edge("S", tactic, a, b, now() - Duration::hours(30))
                .unwrap();
        }

        for success in [true, false] {
            let outcome = Outcome::new("c", "S", "a", success)
                .with_eligibility(credits(&[("a", 2.0), ("b", 1.0), ("c", 1.0)]));
            let result = engine.try_update_after_outcome_at(&outcome, now()).unwrap();

            assert_eq!(result.adjustments.len(), 3);
            let total: f64 = result.adjustments.iter().map(|a| a.delta()).sum();
            assert!((total - 1.0).abs() < 1e-12, "total credit {}", total);
        }

        // "c" had no edge before and was created by the update
        assert!(engine.store.fetch_edge("S", "c").unwrap().is_some());
    }

    #[test]
    fn test_chosen_tactic_edge_exists_without_credit() {
        let engine = engine();
        let outcome = Outcome::new("c", "S", "chosen", true)
            .with_eligibility(credits(&[("helper", 1.0)]));
        let result = engine.try_update_after_outcome_at(&outcome, now()).unwrap();

        assert_eq!(result.adjustments.len(), 1);
        assert_eq!(result.adjustments[0].tactic, "helper");
        let chosen = engine.store.fetch_edge("S", "chosen").unwrap().unwrap();
        assert_eq!((chosen.alpha, chosen.beta, chosen.count), (1.0, 1.0, 0));
    }

    #[test]
    fn test_decision_record_uses_supplied_propensity() {
        let engine = engine();
        engine.store.write_edge("S", "a", 6.0, 2.0, now()).unwrap();
        engine.store.write_edge("S", "b", 2.0, 6.0, now()).unwrap();

        let rec = engine.recommend_at("S", None, RecommendOptions::with_policy(Policy::Hybrid), now());
        let expected = rec.propensity_of("b").unwrap();

        let outcome = Outcome::new("lead-9", "S", "b", false).with_recommendation(rec.clone());
        let result = engine.try_update_after_outcome_at(&outcome, now()).unwrap();
        assert_eq!(result.propensity, Some(expected));

        let records = engine.store.decisions_for_step("S").unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, result.decision_id);
        assert_eq!(record.conversation_id, "lead-9");
        assert_eq!(record.policy, Some(Policy::Hybrid));
        assert_eq!(record.propensity, Some(expected));
        assert_eq!(record.recommendation.len(), rec.len());
        assert!(!record.success);
    }

    #[test]
    fn test_override_has_no_propensity() {
        let engine = engine();
        engine.store.write_edge("S", "a", 3.0, 1.0, now()).unwrap();
        let rec = engine.recommend_at("S", None, RecommendOptions::default(), now());

        // Operator picked something that was not recommended
        let outcome = Outcome::new("lead-2", "S", "manual", true).with_recommendation(rec);
        let result = engine.try_update_after_outcome_at(&outcome, now()).unwrap();
        assert_eq!(result.propensity, None);

        let record = &engine.store.decisions_for_step("S").unwrap()[0];
        assert_eq!(record.propensity, None);
        assert_eq!(record.policy, Some(Policy::Ucb1));
    }

    #[test]
    fn test_blank_outcome_is_dropped() {
        let engine = engine();
        assert!(engine
            .try_update_after_outcome_at(&Outcome::new("c", "", "t", true), now())
            .is_err());
        engine.update_after_outcome_at(&Outcome::new("c", "S", " ", true), now());
        assert!(engine.store.list_steps().unwrap().is_empty());
    }

    /// Fails every write, reads work
    struct NoWrites(SqliteEdgeStore);

    impl EdgeStore for NoWrites {
        fn ensure_edge(&self, s: &str, t: &str) -> StoreResult<EdgeSnapshot> {
            self.0.ensure_edge(s, t)
        }
        fn fetch_edges(&self, s: &str) -> StoreResult<Vec<EdgeSnapshot>> {
            self.0.fetch_edges(s)
        }
        fn write_edge(&self, _: &str, _: &str, _: f64, _: f64, _: DateTime<Utc>) -> StoreResult<()> {
            Err(crate::store::StoreError::Poisoned)
        }
        fn delete_edges(&self, s: &str, t: &[String]) -> StoreResult<usize> {
            self.0.delete_edges(s, t)
        }
        fn delete_stale_edges(&self, s: &str, c: DateTime<Utc>) -> StoreResult<usize> {
            self.0.delete_stale_edges(s, c)
        }
        fn set_edge_cost(&self, s: &str, t: &str, c: Option<f64>) -> StoreResult<usize> {
            self.0.set_edge_cost(s, t, c)
        }
        fn append_decision(&self, r: &DecisionRecord) -> StoreResult<()> {
            self.0.append_decision(r)
        }
        fn decisions_for_step(&self, s: &str) -> StoreResult<Vec<DecisionRecord>> {
            self.0.decisions_for_step(s)
        }
        fn list_steps(&self) -> StoreResult<Vec<String>> {
            self.0.list_steps()
        }
    }

    #[test]
    fn test_store_failure_is_swallowed() {
        let engine = TacticEngine::new(
            EngineConfig::default(),
            NoWrites(SqliteEdgeStore::open_in_memory().unwrap()),
        );
        let outcome = Outcome::new("c", "S", "t", true);

        // Must not panic or propagate
        engine.update_after_outcome_at(&outcome, now());
        assert!(engine.try_update_after_outcome_at(&outcome, now()).is_err());
        assert!(engine.store().0.decisions_for_step("S").unwrap().is_empty());
    }

    #[test]
    fn test_learning_stats() {
        let engine = engine();
        engine.store.write_edge("S", "a", 2.0, 2.0, now()).unwrap();
        engine.store.write_edge("S", "b", 2.0, 2.0, now()).unwrap();
        let rec = engine.recommend_at("S", None, RecommendOptions::with_policy(Policy::Hybrid), now());

        for (tactic, success) in [("a", true), ("a", false), ("b", true)] {
            let outcome = Outcome::new("c", "S", tactic, success).with_recommendation(rec.clone());
            engine.update_after_outcome_at(&outcome, now());
        }
        engine.update_after_outcome_at(&Outcome::new("c", "S", "manual", false), now());

        let stats = engine.learning_stats("S").unwrap();
        assert_eq!(stats.total_decisions, 4);
        assert_eq!(stats.successful_decisions, 2);
        assert!((stats.success_rate - 0.5).abs() < 1e-12);
        assert_eq!(stats.tracked_decisions, 3);
        assert_eq!(stats.untracked_decisions, 1);
        // Equal propensities: the estimate is the tracked success rate
        let estimate = stats.uniform_policy_estimate.unwrap();
        assert!((estimate - 2.0 / 3.0).abs() < 1e-9, "estimate {}", estimate);
        assert_eq!(stats.by_tactic[0].tactic, "a");
        assert_eq!(stats.by_tactic[0].decisions, 2);
    }

    #[test]
    fn test_learning_stats_empty() {
        let stats = LearningStats::from_records("S", &[]);
        assert_eq!(stats.total_decisions, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.uniform_policy_estimate.is_none());
    }
}
