//! tactic-bandit operator CLI
//!
//! Inspect and exercise the tactic engine against a local SQLite file.
//!
//! Run with: cargo run -- --recommend Discovery

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use tactic_bandit::{
    logging, ConfigLoader, EdgeStore, EngineConfig, Outcome, Policy, RecommendOptions,
    SqliteEdgeStore, TacticEngine,
};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config = ConfigLoader::load()?;
    // A second init (e.g. under a test harness) is not fatal
    if let Err(e) = logging::init_logging(&config.log_level) {
        eprintln!("warning: {:#}", e);
    }

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "--recommend" => run_recommend(config, &args[2..]),
        "--outcome" => run_outcome_cmd(config, &args[2..]),
        "--stats" => {
            let step = required(&args, 2, "--stats <step>")?;
            run_stats(config, step)
        }
        "--learning-stats" => {
            let step = required(&args, 2, "--learning-stats <step>")?;
            run_learning_stats(config, step)
        }
        "--prune" => run_prune(config, &args[2..]),
        "--set-cost" => run_set_cost(config, &args[2..]),
        "--steps" => run_steps(config),
        "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("Unknown command: {}", other)
        }
    }
}

fn print_usage() {
    println!("tactic-bandit - adaptive tactic recommendation\n");
    println!("Usage:");
    println!("  tactic-bandit --recommend <step> [--policy=ucb1|thompson|hybrid] [--max=<n>] [--json]");
    println!("  tactic-bandit --outcome <conversation-id> <step> <tactic> --success|--failed [--credit \"a:0.5,b:0.5\"]");
    println!("  tactic-bandit --stats <step>");
    println!("  tactic-bandit --learning-stats <step>");
    println!("  tactic-bandit --prune <step> [--policy=<name>]");
    println!("  tactic-bandit --set-cost <step> <tactic> <cost|none>");
    println!("  tactic-bandit --steps");
    println!("\nConfiguration: ./tactic-bandit.yaml, TACTIC_* environment variables");
}

fn required<'a>(args: &'a [String], index: usize, usage: &str) -> Result<&'a str> {
    match args.get(index) {
        Some(value) => Ok(value.as_str()),
        None => bail!("Usage: tactic-bandit {}", usage),
    }
}

fn get_data_dir() -> Result<PathBuf> {
    // XDG data dir on Linux, ~/Library/Application Support on macOS
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));

    Ok(base.join("tactic-bandit"))
}

fn open_engine(config: EngineConfig) -> Result<TacticEngine<SqliteEdgeStore>> {
    let db_path = match &config.database_path {
        Some(path) => path.clone(),
        None => get_data_dir()?.join("tactics.db"),
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let store = SqliteEdgeStore::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    tracing::debug!(path = %db_path.display(), "database opened");

    Ok(TacticEngine::new(config, store))
}

fn parse_policy(value: &str) -> Result<Policy> {
    value.parse::<Policy>().map_err(anyhow::Error::msg)
}

/// Parse `"a:0.5,b:0.5"` into an eligibility map
fn parse_credit(raw: &str) -> Result<HashMap<String, f64>> {
    let mut credits = HashMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((name, value)) = part.rsplit_once(':') else {
            bail!("Invalid credit entry `{}` (expected tactic:weight)", part);
        };
        let weight: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid credit weight in `{}`", part))?;
        credits.insert(name.trim().to_string(), weight);
    }
    Ok(credits)
}

fn run_recommend(config: EngineConfig, args: &[String]) -> Result<()> {
    let step = required(args, 0, "--recommend <step> [--policy=<name>] [--max=<n>] [--json]")?;

    let mut options = RecommendOptions::default();
    let mut json = false;
    for arg in &args[1..] {
        if let Some(value) = arg.strip_prefix("--policy=") {
            options.policy = Some(parse_policy(value)?);
        } else if let Some(value) = arg.strip_prefix("--max=") {
            let max: usize = value.parse().context("--max expects a positive integer")?;
            if max == 0 {
                bail!("--max expects a positive integer");
            }
            options.max_recommendations = Some(max);
        } else if arg == "--json" {
            json = true;
        }
    }

    let engine = open_engine(config)?;
    let rec = engine.recommend(step, None, options);

    if json {
        println!("{}", serde_json::to_string_pretty(&rec)?);
        return Ok(());
    }

    println!("\n┌──────────────────────────────────────────────────────────────┐");
    println!("│ RECOMMENDATION: {:<44} │", step);
    println!("└──────────────────────────────────────────────────────────────┘\n");
    println!("Policy: {}", rec.policy);

    if rec.is_empty() {
        println!("No tactics known for this step yet. Fall back to the default tactic.");
        return Ok(());
    }

    println!(
        "\n{:<4} {:<28} {:>8} {:>9} {:>7} {:>10}",
        "#", "TACTIC", "P(succ)", "SCORE", "DECAY", "PROPENSITY"
    );
    for (i, t) in rec.tactics.iter().enumerate() {
        println!(
            "{:<4} {:<28} {:>7.1}% {:>9.4} {:>7.3} {:>9.1}%",
            i + 1,
            t.tactic,
            t.estimated_success_probability * 100.0,
            t.score,
            t.decay_factor,
            t.propensity * 100.0
        );
    }
    Ok(())
}

fn run_outcome_cmd(config: EngineConfig, args: &[String]) -> Result<()> {
    if args.len() < 3 {
        println!("Usage: tactic-bandit --outcome <conversation-id> <step> <tactic> --success|--failed [--credit \"a:0.5,b:0.5\"]\n");
        println!("Examples:");
        println!("  tactic-bandit --outcome conv-17 Discovery OpenQuestion --success");
        println!("  tactic-bandit --outcome conv-18 Pitch CaseStudy --failed --credit \"CaseStudy:0.7,Anchor:0.3\"");
        return Ok(());
    }

    let conversation_id = &args[0];
    let step = &args[1];
    let tactic = &args[2];
    let mut success: Option<bool> = None;
    let mut eligibility: Option<HashMap<String, f64>> = None;

    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--success" => success = Some(true),
            "--failed" | "--failure" => success = Some(false),
            "--credit" => {
                if i + 1 < args.len() {
                    i += 1;
                    eligibility = Some(parse_credit(&args[i])?);
                }
            }
            _ => {}
        }
        i += 1;
    }

    let Some(success) = success else {
        bail!("--outcome requires --success or --failed");
    };

    let engine = open_engine(config)?;
    let mut outcome = Outcome::new(conversation_id, step, tactic, success);
    if let Some(eligibility) = eligibility {
        outcome = outcome.with_eligibility(eligibility);
    }

    let result = engine.try_update_after_outcome_at(&outcome, Utc::now())?;

    println!("\n┌──────────────────────────────────────────────────────────────┐");
    println!("│ OUTCOME RECORDED                                             │");
    println!("└──────────────────────────────────────────────────────────────┘\n");
    println!("Conversation: {}", conversation_id);
    println!("Step:         {}", step);
    println!("Tactic:       {}", tactic);
    println!("Outcome:      {}", if success { "SUCCESS" } else { "FAILURE" });
    println!("Decision id:  {}\n", result.decision_id);

    for adj in &result.adjustments {
        println!(
            "  {:<28} credit {:.3}  α {:.3} → {:.3}  β {:.3} → {:.3}",
            adj.tactic, adj.credit, adj.decayed_alpha, adj.new_alpha, adj.decayed_beta, adj.new_beta
        );
    }
    Ok(())
}

fn run_stats(config: EngineConfig, step: &str) -> Result<()> {
    let engine = open_engine(config)?;
    let stats = engine.step_stats(step, Utc::now())?;

    println!("\n┌──────────────────────────────────────────────────────────────┐");
    println!("│ TACTIC POSTERIORS: {:<41} │", step);
    println!("└──────────────────────────────────────────────────────────────┘\n");

    if stats.is_empty() {
        println!("No edges for this step.");
        return Ok(());
    }

    println!(
        "{:<28} {:>7} {:>7} {:>7} {:>17} {:>6} {:>6}",
        "TACTIC", "ALPHA", "BETA", "MEAN", "95% CI", "DECAY", "N"
    );
    for s in &stats {
        println!(
            "{:<28} {:>7.2} {:>7.2} {:>6.1}% [{:>5.1}%, {:>5.1}%] {:>6.3} {:>6}",
            s.tactic,
            s.decayed_alpha,
            s.decayed_beta,
            s.mean * 100.0,
            s.ci_lower * 100.0,
            s.ci_upper * 100.0,
            s.decay_factor,
            s.count
        );
    }
    Ok(())
}

fn run_learning_stats(config: EngineConfig, step: &str) -> Result<()> {
    let engine = open_engine(config)?;
    let stats = engine.learning_stats(step)?;

    println!("\n┌──────────────────────────────────────────────────────────────┐");
    println!("│ LEARNING STATISTICS: {:<39} │", step);
    println!("└──────────────────────────────────────────────────────────────┘\n");

    println!("Decisions:    {}", stats.total_decisions);
    println!(
        "Successes:    {} ({:.1}%)",
        stats.successful_decisions,
        stats.success_rate * 100.0
    );
    println!("Tracked:      {}", stats.tracked_decisions);
    println!("Untracked:    {}", stats.untracked_decisions);
    match stats.uniform_policy_estimate {
        Some(v) => println!("Uniform-pick estimate (SNIPS): {:.1}%", v * 100.0),
        None => println!("Uniform-pick estimate (SNIPS): n/a (no tracked decisions)"),
    }

    if !stats.by_tactic.is_empty() {
        println!("\nBY TACTIC:");
        for t in &stats.by_tactic {
            println!("  {:<28} {:>4}/{:<4}", t.tactic, t.successes, t.decisions);
        }
    }
    Ok(())
}

fn run_prune(config: EngineConfig, args: &[String]) -> Result<()> {
    let step = required(args, 0, "--prune <step> [--policy=<name>]")?;
    let mut policy = config.policy;
    for arg in &args[1..] {
        if let Some(value) = arg.strip_prefix("--policy=") {
            policy = parse_policy(value)?;
        }
    }

    if !config.top_k_enabled() {
        println!("Top-K pruning is disabled (top_k = 0).");
        return Ok(());
    }

    let top_k = config.top_k;
    let engine = open_engine(config)?;
    let deleted = engine.prune_top_k(step, policy, Utc::now())?;
    println!("Pruned {} edge(s) from {} (kept top {} by {})", deleted, step, top_k, policy);
    Ok(())
}

fn run_set_cost(config: EngineConfig, args: &[String]) -> Result<()> {
    let usage = "--set-cost <step> <tactic> <cost|none>";
    let step = required(args, 0, usage)?;
    let tactic = required(args, 1, usage)?;
    let raw = required(args, 2, usage)?;

    let cost = match raw {
        "none" | "-" => None,
        value => Some(
            value
                .parse::<f64>()
                .with_context(|| format!("Invalid cost `{}`", value))?,
        ),
    };

    let engine = open_engine(config)?;
    engine.store().ensure_edge(step, tactic)?;
    engine.store().set_edge_cost(step, tactic, cost)?;

    match cost {
        Some(c) => println!("Cost of {} -> {} set to {}", step, tactic, c),
        None => println!("Cost of {} -> {} cleared", step, tactic),
    }
    Ok(())
}

fn run_steps(config: EngineConfig) -> Result<()> {
    let engine = open_engine(config)?;
    let steps = engine.store().list_steps()?;

    if steps.is_empty() {
        println!("No steps recorded yet.");
        return Ok(());
    }

    for step in steps {
        let edges = engine.store().fetch_edges(&step)?;
        println!("{:<32} {} tactic(s)", step, edges.len());
    }
    Ok(())
}
