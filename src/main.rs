// Stream sync daemon - main entry point
// Copyright (C) 2026 - streamsync contributors
// Licensed under LGPL v2.1 or later
//
// Serves a clock, follows a remote clock, or both.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use streamsync::clock::MonotonicClock;
use streamsync::config::Config;
use streamsync::pool::{RequestContext, ThreadKind, ThreadPool};
use streamsync::{ClockSyncClient, TimeProvider};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    init_logging(config.verbose);

    info!("Starting stream sync");

    let pool = ThreadPool::with_max_threads(config.max_threads)?;
    info!("Thread pool ready (max_threads={})", pool.max_threads());

    // 1. Time provider, on a dedicated media context
    let mut provider_ctx = None;
    if let Some(addr) = config.provider_addr()? {
        let pool_clone = pool.clone();
        let ctx = tokio::task::spawn_blocking(move || pool_clone.get_thread(ThreadKind::Media, &RequestContext::default()))
            .await??
            .ok_or("no media context available")?;
        let source = Arc::new(MonotonicClock::new());
        let (bound, provider) = match TimeProvider::spawn_on(&ctx, addr, source).await {
            Ok(started) => started,
            Err(e) => {
                error!("Failed to start time provider on {}: {}", addr, e);
                return Err(e.into());
            }
        };
        info!("Serving time on {} (context {})", bound, ctx.id());
        provider_ctx = Some((ctx, provider));
    }

    // 2. Clock client
    let mut client = None;
    if let Some(settings) = config.client_settings()? {
        info!("Synchronizing to {}:{}", settings.address, settings.port);
        let mut c = ClockSyncClient::new(settings)?;
        c = tokio::task::spawn_blocking(move || c.start().map(|_| c)).await??;
        client = Some(c);
    }

    if provider_ctx.is_none() && client.is_none() {
        warn!("Nothing to do! Use --provide [host:]port and/or --remote HOST");
    }

    // 3. Periodic statistics
    let status_interval = config.status_interval;
    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    ticker.tick().await;

    info!("Ready");

    loop {
        tokio::select! {
            _ = ticker.tick(), if status_interval > 0 => {
                if let Some(c) = &client {
                    match serde_json::to_string(&c.stats()) {
                        Ok(json) => info!("Sync status: {}", json),
                        Err(e) => error!("Failed to encode status: {}", e),
                    }
                }
            }
            res = signal::ctrl_c() => {
                match res {
                    Ok(()) => info!("Received shutdown signal (Ctrl+C)"),
                    Err(err) => {
                        error!("Unable to listen for shutdown signal: {}", err);
                        return Err(err.into());
                    }
                }
                break;
            }
        }
    }

    // Graceful shutdown
    info!("Shutting down...");
    if let Some(mut c) = client {
        tokio::task::spawn_blocking(move || c.stop()).await?;
    }
    if let Some((ctx, provider)) = provider_ctx {
        provider.abort();
        ctx.release();
    }
    tokio::task::spawn_blocking(move || pool.cleanup()).await?;

    info!("Stopped");
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_names(verbose)
        .with_level(true);

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
