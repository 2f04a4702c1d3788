use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rdg_storage::ConfigStore;
use rdg_sync::ChangeWatcher;
use rdg_web::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info,sqlx=warn,hyper=warn";

#[derive(Debug, Parser)]
#[command(name = "rdg")]
#[command(about = "Report data gateway: cached and live report reads over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API (default).
    Serve,
    /// Refresh daily-cached reports now and print the run summary.
    Refresh {
        /// Reports to refresh; every daily report when omitted.
        names: Vec<String>,
    },
    /// Run the change watcher in the foreground.
    Watch {
        /// Check once and exit.
        #[arg(long)]
        once: bool,
    },
    /// Validate the endpoint definitions file.
    CheckConfig,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => rdg_web::serve_from_env().await?,
        Commands::Refresh { names } => {
            let state = AppState::from_env().await?;
            let names = (!names.is_empty()).then_some(names);
            let summary = state.refresher.refresh(names.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.errors.is_empty() {
                bail!("refresh finished with errors for {} report(s)", summary.errors.len());
            }
        }
        Commands::Watch { once } => {
            let state = AppState::from_env().await?;
            let watcher = ChangeWatcher::new(state.refresher);
            if once {
                let tick = watcher.tick(chrono::Local::now()).await?;
                println!("{}", serde_json::to_string_pretty(&tick)?);
            } else {
                tokio::select! {
                    _ = watcher.run() => {}
                    result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
                }
            }
        }
        Commands::CheckConfig => {
            let store = ConfigStore::from_env();
            let catalog = store
                .load()
                .await
                .with_context(|| format!("loading {}", store.path().display()))?;
            for report in catalog.reports.values() {
                println!(
                    "ok       {:<32} {:<14} cache={} info_types={}",
                    report.name,
                    report.data_policy().as_str(),
                    report.cache_policy.as_str(),
                    report.info_types().join(",")
                );
            }
            for (name, reason) in &catalog.rejected {
                println!("invalid  {name:<32} {reason}");
            }
            if !catalog.rejected.is_empty() {
                bail!(
                    "{} of {} endpoint definitions are invalid",
                    catalog.rejected.len(),
                    catalog.rejected.len() + catalog.len()
                );
            }
        }
    }

    Ok(())
}
