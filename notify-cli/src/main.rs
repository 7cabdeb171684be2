mod cli;
mod config;
mod output;

use std::process;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use notify_sync::{
    ListQuery, NotificationApi, NotificationEngine, PresentationEvent, RestClient, SyncConfig,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::output::OutputManager;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let output = OutputManager::new(args.output);

    if let Err(e) = run(args, &output).await {
        error!("Application error: {e:#}");
        if output.is_json() {
            println!("{}", output.error(&format!("{e:#}")));
        } else {
            eprintln!("{}", output.error(&format!("{e:#}")));
        }
        process::exit(1);
    }
}

async fn run(args: Args, output: &OutputManager) -> Result<()> {
    init_logging(args.verbose, args.quiet, args.json_logs)?;

    let mut config = config::load(args.config.as_deref())?;
    config::apply_overrides(&mut config, &args);

    match args.command {
        Commands::Watch { poll, interval } => {
            if poll {
                config.realtime.use_push = false;
            }
            if let Some(secs) = interval {
                config.realtime.poll_interval_ms = secs.saturating_mul(1000);
            }
            watch(config, output).await?;
        }
        Commands::List {
            unread,
            read,
            category,
            priority,
            keyword,
            page,
            size,
        } => {
            let query = ListQuery {
                page,
                size,
                read: (unread || read).then_some(read),
                category,
                priority,
                keyword,
                ..ListQuery::default()
            };
            let page = rest(&config)?
                .list(&query)
                .await
                .context("Failed to list notifications")?;
            println!("{}", output.page(&page));
        }
        Commands::Unread => {
            let count = rest(&config)?
                .unread_count()
                .await
                .context("Failed to fetch unread count")?;
            println!("{}", output.unread_count(count));
        }
        Commands::Read { ids } => {
            let api = rest(&config)?;
            let acked = match ids.as_slice() {
                [id] => api.mark_read(id).await,
                _ => api.mark_batch_read(&ids).await,
            };
            acked.context("Failed to mark notifications read")?;
            println!("{}", output.done("marked read", &ids));
        }
        Commands::ReadAll => {
            rest(&config)?
                .mark_all_read()
                .await
                .context("Failed to mark all notifications read")?;
            println!("{}", output.done("marked read", &[]));
        }
        Commands::Delete { ids } => {
            let api = rest(&config)?;
            let acked = match ids.as_slice() {
                [id] => api.delete(id).await,
                _ => api.delete_batch(&ids).await,
            };
            acked.context("Failed to delete notifications")?;
            println!("{}", output.done("deleted", &ids));
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("Refusing to delete every notification without --yes");
            }
            rest(&config)?
                .delete_all()
                .await
                .context("Failed to delete all notifications")?;
            println!("{}", output.done("deleted", &[]));
        }
        Commands::Config => {
            config.validate()?;
            println!("{}", config::show(&config)?);
        }
    }

    Ok(())
}

fn rest(config: &SyncConfig) -> Result<RestClient> {
    config.validate()?;
    RestClient::new(config).context("Failed to build REST client")
}

/// Run the engine until Ctrl-C, printing the initial list and then live events.
async fn watch(config: SyncConfig, output: &OutputManager) -> Result<()> {
    if config.user_id.is_empty() {
        warn!("No user id configured; the channel may reject the session");
    }
    info!(
        endpoint = %config.endpoint,
        push = config.realtime.use_push,
        "Starting notification engine"
    );

    let engine = NotificationEngine::start(config).context("Failed to start engine")?;
    let presenter = engine.presenter();
    let mut events = presenter.events();
    let mut shown_initial = false;

    let result = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if !shown_initial && matches!(event, PresentationEvent::SnapshotChanged { .. }) {
                        shown_initial = true;
                        let snapshot = presenter.snapshot().await?;
                        println!("{}", output.snapshot(&snapshot));
                        continue;
                    }
                    if let Some(line) = output.event(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    info!("Shutting down");
    if tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .is_err()
    {
        warn!("Engine did not stop within 5s");
    }
    result
}

fn init_logging(verbose: bool, quiet: bool, json: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_level(verbose)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }
    Ok(())
}
