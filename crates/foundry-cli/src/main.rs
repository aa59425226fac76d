//! foundry - multi-tenant task orchestrator
//!
//! Validates configuration files and runs a local simulation of the
//! orchestrator against synthetic operations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use foundry_core::{OrchestrationConfig, ResourceBundle, Task, TaskKind};
use foundry_runtime::{
    health_check_fn, Operation, OperationError, OperationOutput, OrchestrationContext,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// foundry - multi-tenant task orchestrator
#[derive(Parser, Debug)]
#[command(name = "foundry")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to a YAML or JSON config
        path: PathBuf,
    },

    /// Run synthetic tasks through the orchestrator and print a report
    Simulate {
        /// Path to a YAML or JSON config (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of tasks to submit
        #[arg(short, long, default_value = "50")]
        tasks: usize,

        /// Number of tenants to spread tasks across
        #[arg(long, default_value = "3")]
        tenants: usize,

        /// Make every Nth operation call fail (0 disables failures)
        #[arg(long, default_value = "0")]
        fail_every: u64,

        /// Simulated operation latency in milliseconds
        #[arg(long, default_value = "20")]
        latency_ms: u64,
    },
}

/// Operation that sleeps and bills the task's estimate.
struct SimulatedOperation {
    name: String,
    latency: Duration,
    fail_every: u64,
    calls: AtomicU64,
}

#[async_trait]
impl Operation for SimulatedOperation {
    async fn run(
        &self,
        task: &Task,
        resources: &ResourceBundle,
    ) -> Result<OperationOutput, OperationError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(self.latency).await;

        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(OperationError::new(format!("{} call {} failed", self.name, call))
                .with_cost(task.estimated_cost / 2.0));
        }
        Ok(OperationOutput::new(
            serde_json::json!({
                "kind": self.name,
                "namespace": resources.namespace,
                "ports": resources.ports,
            }),
            task.estimated_cost,
        ))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Serialize)]
struct SimulationSummary {
    submitted: usize,
    rejected: BTreeMap<String, usize>,
    report: foundry_runtime::ResilienceReport,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::CheckConfig { path } => check_config(&path),
        Commands::Simulate {
            config,
            tasks,
            tenants,
            fail_every,
            latency_ms,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => OrchestrationConfig::default(),
            };
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(simulate(
                config,
                tasks,
                tenants.max(1),
                fail_every,
                Duration::from_millis(latency_ms),
            ))
        }
    }
}

fn load_config(path: &Path) -> Result<OrchestrationConfig> {
    OrchestrationConfig::from_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let yaml = serde_yaml::to_string(&config).context("Failed to render config")?;
    println!("{}", yaml);
    tracing::info!(path = %path.display(), "Configuration is valid");
    Ok(())
}

async fn simulate(
    config: OrchestrationConfig,
    tasks: usize,
    tenants: usize,
    fail_every: u64,
    latency: Duration,
) -> Result<()> {
    let kinds = [
        TaskKind::MarketResearch,
        TaskKind::BusinessPlan,
        TaskKind::ProjectScaffold,
        TaskKind::CodeGeneration,
        TaskKind::Deployment,
    ];

    let mut builder = OrchestrationContext::builder().config(config);
    for kind in &kinds {
        builder = builder
            .operation(
                kind.clone(),
                Arc::new(SimulatedOperation {
                    name: kind.component().to_string(),
                    latency,
                    fail_every,
                    calls: AtomicU64::new(0),
                }),
            )
            .health_check(kind.component(), Arc::new(health_check_fn(|| true)));
    }
    let context = builder.build().context("Invalid configuration")?;
    context.start();

    let mut submitted = Vec::new();
    let mut rejected: BTreeMap<String, usize> = BTreeMap::new();
    for i in 0..tasks {
        let kind = kinds[i % kinds.len()].clone();
        let task = Task::new(format!("tenant-{}", i % tenants), kind)
            .with_estimated_cost(0.05)
            .with_payload(serde_json::json!({ "index": i }));
        match context.submit(task) {
            Ok(id) => submitted.push(id),
            Err(err) => *rejected.entry(err.code().to_string()).or_default() += 1,
        }
    }

    let processor = context.processor();
    while submitted
        .iter()
        .any(|id| !processor.task_state(id).is_some_and(|s| s.is_terminal()))
    {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let summary = SimulationSummary {
        submitted: submitted.len(),
        rejected,
        report: context.resilience_report(),
    };
    context.shutdown().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to render report")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_config_accepts_borrowed_path() {
        let path = std::env::temp_dir().join(format!("foundry-cli-{}.yaml", std::process::id()));
        std::fs::write(&path, "queue:\n  max_concurrent: 2\n").unwrap();

        let config = load_config(path.as_path()).unwrap();
        assert_eq!(config.queue.max_concurrent, 2);
        assert!(check_config(&path).is_ok());

        std::fs::remove_file(&path).unwrap();
        assert!(load_config(Path::new("/nonexistent/foundry.yaml")).is_err());
    }
}
