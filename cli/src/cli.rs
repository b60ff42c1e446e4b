use anyhow::{Context, Result};
use sieve_core::config::SieveConfig;
use sieve_core::job::{JobId, JobStatus, JobStatusView};
use sieve_core::metrics::METRICS;
use sieve_core::rule::RuleTree;
use sieve_core::CleaningEngine;
use tracing::{info, warn};

fn load_rules(path: &str) -> Result<RuleTree> {
    let payload = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rule file '{}'", path))?;
    RuleTree::from_json(&payload).with_context(|| format!("Invalid rule file '{}'", path))
}

async fn load_engine(config_path: &str) -> Result<CleaningEngine> {
    let config = SieveConfig::from_file(config_path)
        .with_context(|| format!("Failed to load configuration '{}'", config_path))?;
    CleaningEngine::from_config(config).await
}

pub async fn validate_rules(config_path: &str, dataset: &str, rules_path: &str) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let rules = load_rules(rules_path)?;

    match engine.compile(dataset, &rules).await {
        Ok(predicate) if predicate.selects_nothing() => {
            println!("⚠️  Rules are valid but contain no conditions; nothing would be selected");
            Ok(())
        }
        Ok(predicate) => {
            println!(
                "✅ Rules are valid for '{}' ({} conditions)",
                dataset,
                predicate.leaf_count()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Rules rejected: {}", e);
            Err(e.into())
        }
    }
}

pub async fn preview_rules(config_path: &str, dataset: &str, rules_path: &str) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let rules = load_rules(rules_path)?;

    let result = engine.preview(dataset, &rules).await?;
    println!(
        "{} of {} sample rows match",
        result.matches, result.total
    );
    Ok(())
}

pub async fn run_job(
    config_path: &str,
    dataset: &str,
    rules_path: &str,
    print_metrics: bool,
) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let rules = load_rules(rules_path)?;

    let job_id = engine.submit(dataset, rules).await?;
    info!(job_id = %job_id, "Waiting for job; press Ctrl-C to cancel");

    let view = tokio::select! {
        view = engine.wait(&job_id) => view?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %job_id, "Interrupted, cancelling job");
            engine.cancel(&job_id).await?;
            engine.wait(&job_id).await?
        }
    };

    print_view(&view)?;
    if print_metrics {
        print!("{}", METRICS.to_prometheus());
    }
    engine.shutdown().await;

    match view.status {
        JobStatus::Failed => anyhow::bail!(
            "Job {} failed: {}",
            job_id,
            view.error_message.unwrap_or_default()
        ),
        _ => Ok(()),
    }
}

pub async fn show_status(config_path: &str, job: &str) -> Result<()> {
    let config = SieveConfig::from_file(config_path)?;
    if config.engine.persistence_path.is_none() {
        anyhow::bail!("engine.persistence_path is not set; jobs are not persisted");
    }
    let job_id: JobId = job
        .parse()
        .with_context(|| format!("'{}' is not a job id", job))?;

    let engine = CleaningEngine::from_config(config).await?;
    let view = engine.status(&job_id).await?;
    print_view(&view)
}

fn print_view(view: &JobStatusView) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(view)?);
    Ok(())
}
