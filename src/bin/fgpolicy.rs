use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use foreground_policy::adapters::{JsonFileStore, StdEnvAdapter, StdTimeAdapter};
use foreground_policy::discovery;
use foreground_policy::observability::init_observability;
use foreground_policy::ports::KeyValueStore;
use foreground_policy::rate::RateLimiter;
use foreground_policy::{EngineConfig, EngineDeps, ForegroundStabilizer, PolicyEngine};

#[derive(Parser, Debug)]
#[command(name = "fgpolicy", version)]
struct Cli {
    /// YAML config; built-in defaults when omitted
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed foreground ids from stdin, one per line
    Run {
        /// Skip the stabilizer and forward every line as-is
        #[arg(long = "raw")]
        raw: bool,
        /// Re-check privilege (with retries) before reading input
        #[arg(long = "request-privilege")]
        request_privilege: bool,
    },
    /// Print the resolved privilege channel
    Resolve,
    /// Request privilege and run the one-time discovery action
    Discover,
    /// Print persisted rate and discovery state as JSON
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    cfg.apply_env_overrides(&StdEnvAdapter);
    init_observability(&cfg.logging).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let store_path = cfg.store_path();
    let store: Arc<dyn KeyValueStore> = Arc::new(
        JsonFileStore::open(&store_path)
            .with_context(|| format!("opening state store {}", store_path.display()))?,
    );

    match cli.command {
        Commands::Status => {
            let rate = RateLimiter::new(Arc::clone(&store), Arc::new(StdTimeAdapter), cfg.rate.clone());
            let status = json!({
                "store": store_path.display().to_string(),
                "rate": rate.state(),
                "discovery": {
                    "done": store.get_bool(discovery::KEY_DONE)?.unwrap_or(false),
                    "at": store.get_u64(discovery::KEY_AT)?,
                },
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Resolve => {
            let engine = PolicyEngine::from_config(&cfg, EngineDeps::system(store))?;
            let channel = engine.resolver().resolve().await;
            println!("{channel}");
        }
        Commands::Discover => {
            let engine = PolicyEngine::from_config(&cfg, EngineDeps::system(store))?;
            let grant = engine.request_privilege().await;
            let out = json!({
                "channel": grant.channel,
                "dispatched": grant.discovered,
                "done": engine.discovery().is_done(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Run {
            raw,
            request_privilege,
        } => {
            let engine = Arc::new(PolicyEngine::from_config(&cfg, EngineDeps::system(store))?);
            if request_privilege {
                let grant = engine.request_privilege().await;
                info!(channel = %grant.channel, discovered = grant.discovered, "Privilege request finished");
            }
            let stabilizer = (!raw).then(|| {
                ForegroundStabilizer::new(engine.clone(), &cfg.stabilizer)
            });

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match &stabilizer {
                            Some(s) => s.on_window_changed(&line),
                            None => {
                                let id = line.trim();
                                if !id.is_empty() {
                                    engine.on_foreground_changed(id);
                                }
                            }
                        },
                        Ok(None) => {
                            // let the last candidate settle before draining
                            if stabilizer.as_ref().is_some_and(|s| s.is_pending()) {
                                tokio::time::sleep(Duration::from_millis(cfg.stabilizer.stable_ms + 50)).await;
                            }
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "stdin read failed");
                            break;
                        }
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted");
                        if let Some(s) = &stabilizer {
                            s.interrupt();
                        }
                        break;
                    }
                }
            }
            engine.flush().await;
        }
    }
    Ok(())
}
