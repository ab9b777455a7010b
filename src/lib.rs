//! tactic-bandit - adaptive tactic recommendation
//!
//! Learns, per conversation step, which tactic most reliably moves a guided
//! dialogue forward. Every (step, tactic) pair is a Beta-Bernoulli arm whose
//! evidence fades with an exponential half-life, so the ranking follows
//! whatever currently works.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tactic_bandit::{ConfigLoader, Outcome, RecommendOptions, SqliteEdgeStore, TacticEngine};
//!
//! let config = ConfigLoader::load()?;
//! let store = SqliteEdgeStore::open(&db_path)?;
//! let engine = TacticEngine::new(config, store);
//!
//! // Before choosing a tactic (never fails; empty means "use your default")
//! let rec = engine.recommend("Discovery", None, RecommendOptions::default());
//!
//! // After the reflection service judged the turn
//! let outcome = Outcome::new("conv-42", "Discovery", "OpenQuestion", true)
//!     .with_recommendation(rec);
//! engine.update_after_outcome(&outcome);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐     ┌───────────────────────────────┐
//! │ dialogue engine              │     │ reflection service            │
//! └──────────────┬───────────────┘     └───────────────┬───────────────┘
//!                │ recommend(step)                     │ update_after_outcome
//!                ▼                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ TacticEngine                                                        │
//! │   engine:  TTL prune → rank (policy) → truncate → Top-K prune       │
//! │   outcome: eligibility split → decay → Beta update → decision log   │
//! └──────────────┬──────────────────────────────────────────────────────┘
//!                │ EdgeStore
//!                ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ SqliteEdgeStore: steps, tactics, step_tactic_edges, decision_records│
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! `TacticEngine` is `Send + Sync` and can sit behind an `Arc`. Each store
//! call is atomic, but an outcome update reads, decays and writes an edge in
//! separate calls. Two concurrent updates to the same (step, tactic) pair
//! therefore race and the last writer wins.

pub mod config;
pub mod decay;
pub mod engine;
pub mod logging;
pub mod outcome;
pub mod policy;
pub mod sampling;
pub mod store;
pub mod types;

pub use config::{ConfigError, ConfigLoader, EngineConfig, HybridWeights};
pub use engine::{TacticEngine, TacticStats};
pub use outcome::{normalize_eligibility, CreditAdjustment, LearningStats, OutcomeResult, TacticOutcomes};
pub use policy::Policy;
pub use store::{EdgeStore, SqliteEdgeStore, StoreError, StoreResult};
pub use types::*;
