use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use watchpost::{
    CacheBackendKind, OutputFormat, RunRequest, SystemClock, Watchpost, WatchpostConfig, api,
};

#[derive(Parser)]
#[command(name = "watchpost")]
#[command(about = "Checkmk-compatible monitoring agent with deduplicated, cached checks")]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true, env = "WATCHPOST_CONFIG")]
    config: Option<PathBuf>,
    /// Execution environment this instance runs in
    #[arg(long, global = true, env = "WATCHPOST_EXECUTION_ENVIRONMENT")]
    execution_environment: Option<String>,
    /// Cache backend: memory, disk or remote
    #[arg(long, global = true, env = "WATCHPOST_CACHE_BACKEND")]
    cache_backend: Option<CacheBackendKind>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the agent output and executor endpoints over HTTP
    Serve {
        /// Bind address, e.g. 0.0.0.0:8080
        #[arg(long, env = "WATCHPOST_BIND")]
        bind: Option<String>,
    },
    /// Run checks once and print the agent output
    RunOnce {
        /// Only run these check ids
        #[arg(long = "check")]
        checks: Vec<String>,
        /// Output format: local or section
        #[arg(long)]
        format: Option<OutputFormat>,
        /// Print the JSON run report instead of agent output
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List registered checks in registration order
    ListChecks,
    /// Print the piggyback hostnames checks report under
    GetCheckHostnames,
    /// Load the configuration and report checks that cannot run here
    VerifyCheckConfiguration,
    /// Drop cached results of a check
    Invalidate {
        check: String,
        /// Check arguments as name=value
        #[arg(long = "arg", value_parser = parse_argument)]
        arguments: Vec<(String, String)>,
    },
}

fn parse_argument(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected name=value, got `{}`", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("watchpost=info"))?,
        )
        .init();

    let cli = Cli::parse();

    let mut config = WatchpostConfig::load(cli.config.as_deref())?;
    if let Some(environment) = cli.execution_environment {
        config.execution_environment = environment;
    }
    if let Some(backend) = cli.cache_backend {
        config.cache.backend = backend;
    }

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            let app = Watchpost::from_config(&config, Arc::new(SystemClock), |_, _| Ok(())).await?;

            let router = api::create_router(Arc::new(app));
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("Watchpost listening on http://{}", bind);

            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutting down");
                })
                .await?;
        }
        Commands::RunOnce {
            checks,
            format,
            json,
        } => {
            if let Some(format) = format {
                config.output_format = format;
            }
            let app = Watchpost::from_config(&config, Arc::new(SystemClock), |_, _| Ok(())).await?;

            let request = if checks.is_empty() {
                RunRequest::all()
            } else {
                RunRequest::only(checks)
            };
            let report = app.run(&request).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", app.render(&report));
            }
        }
        Commands::ListChecks => {
            let app = Watchpost::from_config(&config, Arc::new(SystemClock), |_, _| Ok(())).await?;

            for check in app.registry().list_checks() {
                let targets: Vec<_> = check.targets().iter().map(|t| t.name()).collect();
                println!("{}", check.id());
                println!("    Service: {}", check.service_name());
                println!("    Targets: {}", targets.join(", "));
                if let Some(ttl) = check.cache_for() {
                    println!("    Cache for: {}s", ttl.as_secs());
                }
            }
        }
        Commands::GetCheckHostnames => {
            let app = Watchpost::from_config(&config, Arc::new(SystemClock), |_, _| Ok(())).await?;

            for hostname in app.check_hostnames() {
                println!("{}", hostname);
            }
        }
        Commands::VerifyCheckConfiguration => {
            let app = Watchpost::from_config(&config, Arc::new(SystemClock), |_, _| Ok(())).await?;

            let issues = app.verify();
            if issues.is_empty() {
                println!("Check configurations verified.");
            } else {
                for issue in &issues {
                    println!("{} ({}): {}", issue.check, issue.environment, issue.problem);
                }
                anyhow::bail!("{} check configuration problem(s) found", issues.len());
            }
        }
        Commands::Invalidate { check, arguments } => {
            let app = Watchpost::from_config(&config, Arc::new(SystemClock), |_, _| Ok(())).await?;

            let Some(found) = app.registry().get(&check).cloned() else {
                anyhow::bail!("Check `{}` is not registered", check);
            };
            let arguments: BTreeMap<String, String> = arguments.into_iter().collect();
            app.invalidate(&found, &arguments).await?;
            println!("Invalidated cached results of {}", found.id());
        }
    }

    Ok(())
}
