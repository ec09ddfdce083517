use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use replab_audit::ExperimentAudit;
use replab_core::config::SAMPLE_CONFIG;
use replab_core::{atomic_write_bytes, load_config, ControllerConfig};
use replab_runner::{OperationLock, ReconcileOutcome, ReconciliationController};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "replab.yaml";

#[derive(Parser)]
#[command(name = "replab", version, about = "Reconcile LLM replication experiments")]
struct Cli {
    /// Log at debug level regardless of RUST_LOG.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the experiment verdict.
    Audit {
        experiment_dir: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the state of every replication.
    Status {
        experiment_dir: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Reconcile the experiment until it is complete or stops making progress.
    Run {
        experiment_dir: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the experiment results table and finalize the event log.
    Aggregate {
        experiment_dir: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a sample configuration file.
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

/// Command result: an optional JSON document and whether the process
/// should exit successfully.
struct Reply {
    payload: Option<Value>,
    success: bool,
}

impl Reply {
    fn done(payload: Option<Value>) -> Self {
        Self {
            payload,
            success: true,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(reply) => {
            if let Some(payload) = &reply.payload {
                emit_json(payload);
            }
            if !reply.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn load(config: &Path) -> Result<ControllerConfig> {
    Ok(load_config(config)?)
}

fn run_command(command: Commands) -> Result<Reply> {
    match command {
        Commands::Audit {
            experiment_dir,
            config,
            json,
        } => {
            let controller = ReconciliationController::from_config(&experiment_dir, load(&config)?);
            let audit = controller.audit();
            if json {
                return Ok(Reply::done(Some(json!({
                    "ok": true,
                    "command": "audit",
                    "experiment_dir": experiment_dir,
                    "verdict": audit.verdict,
                    "expected": audit.expected,
                    "valid": audit.valid_count(),
                    "missing": audit.missing,
                    "ignored": audit.ignored,
                }))));
            }
            println!("experiment: {}", experiment_dir.display());
            println!("valid: {}/{}", audit.valid_count(), audit.expected);
            if !audit.ignored.is_empty() {
                println!("ignored: {}", audit.ignored.len());
            }
            println!("verdict: {}", audit.verdict);
        }
        Commands::Status {
            experiment_dir,
            config,
            json,
        } => {
            let controller = ReconciliationController::from_config(&experiment_dir, load(&config)?);
            let audit = controller.audit();
            if json {
                return Ok(Reply::done(Some(json!({
                    "ok": true,
                    "command": "status",
                    "experiment_dir": experiment_dir,
                    "replications": audit.replications,
                    "missing": audit.missing,
                    "verdict": audit.verdict,
                }))));
            }
            print_status(&audit);
        }
        Commands::Run {
            experiment_dir,
            config,
            workers,
            json,
        } => {
            let mut config = load(&config)?;
            if let Some(workers) = workers {
                if workers == 0 {
                    bail!("--workers must be at least 1");
                }
                config.runtime.workers = workers;
            }
            let _lock = OperationLock::acquire(&experiment_dir)?;
            tracing::info!(
                dir = %experiment_dir.display(),
                workers = config.runtime.workers,
                replications = config.experiment.replications,
                "starting reconcile"
            );
            let controller = ReconciliationController::from_config(&experiment_dir, config);
            let outcome = controller.reconcile()?;
            let success = outcome.is_converged();
            if json {
                return Ok(Reply {
                    payload: Some(json!({
                        "ok": success,
                        "command": "run",
                        "experiment_dir": experiment_dir,
                        "outcome": outcome,
                    })),
                    success,
                });
            }
            print_outcome(&outcome);
            return Ok(Reply {
                payload: None,
                success,
            });
        }
        Commands::Aggregate {
            experiment_dir,
            config,
            json,
        } => {
            let _lock = OperationLock::acquire(&experiment_dir)?;
            let controller = ReconciliationController::from_config(&experiment_dir, load(&config)?);
            let record = controller.aggregate()?;
            if json {
                return Ok(Reply {
                    payload: Some(json!({
                        "ok": record.success,
                        "command": "aggregate",
                        "experiment_dir": experiment_dir,
                        "action": record,
                    })),
                    success: record.success,
                });
            }
            println!("aggregate: {}", if record.success { "ok" } else { "failed" });
            println!("detail: {}", record.detail);
            return Ok(Reply {
                payload: None,
                success: record.success,
            });
        }
        Commands::Init { path, force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                );
            }
            atomic_write_bytes(&path, SAMPLE_CONFIG.as_bytes())?;
            println!("wrote {}", path.display());
        }
    }
    Ok(Reply::done(None))
}

fn print_status(audit: &ExperimentAudit) {
    println!("experiment: {}", audit.dir.display());
    for r in &audit.replications {
        let index = r
            .index
            .map(|i| format!("{:03}", i))
            .unwrap_or_else(|| "---".to_string());
        let name = r
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        println!("{}  {:<24} {}", index, r.classification.label(), name);
        for finding in &r.findings {
            println!("       {}", finding);
        }
    }
    for i in &audit.missing {
        println!("{:03}  {:<24} -", i, "missing");
    }
    println!("verdict: {}", audit.verdict);
}

fn print_outcome(outcome: &ReconcileOutcome) {
    for action in &outcome.actions {
        let replication = action
            .replication
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} rep={} {} ({} ms) {}",
            action.action,
            replication,
            if action.success { "ok" } else { "failed" },
            action.elapsed_ms,
            action.detail
        );
    }
    println!("status: {:?}", outcome.status);
    println!("iterations: {}", outcome.iterations);
    println!("verdict: {}", outcome.final_verdict);
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Audit { json, .. }
        | Commands::Status { json, .. }
        | Commands::Run { json, .. }
        | Commands::Aggregate { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_worker_override() {
        let cli = Cli::try_parse_from(["replab", "run", "exp", "--workers", "8", "--json"])
            .expect("parse");
        match cli.command {
            Commands::Run { workers, json, config, .. } => {
                assert_eq!(workers, Some(8));
                assert!(json);
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let root = tempfile::tempdir().expect("tmp dir");
        let path = root.path().join("replab.yaml");
        run_command(Commands::Init {
            path: path.clone(),
            force: false,
        })
        .expect("first init");
        assert!(load_config(&path).is_ok());
        assert!(run_command(Commands::Init {
            path: path.clone(),
            force: false
        })
        .is_err());
        assert!(run_command(Commands::Init { path, force: true }).is_ok());
    }
}
