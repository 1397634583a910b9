//! # Peregrine Server
//!
//! Linux-only HTTP/1.1 server: one epoll reactor thread, a pool of worker
//! threads, and a bounded MySQL connection pool behind it.
//!
//! ## Overview
//!
//! - **Static files** are served from the document root with `mmap` +
//!   `writev`, keep-alive honored
//! - **Login/registration** run against a `user` table, fronted by an
//!   in-memory directory loaded at startup
//! - **Two dispatch models**: Proactor (the reactor performs socket I/O)
//!   and Reactor (workers perform the I/O), selected with `-a`
//! - **Idle connections** are reaped by an ascending timer list driven
//!   from a `SIGALRM` tick
//!
//! Wiring happens here, in dependency order: configuration, log sink,
//! database pool, user directory, worker pool, reactor.

mod config;
mod reactor;
mod signals;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use peregrine_core::logsink::{PlainFormat, RotatingSink, SinkWriter};
use peregrine_core::{CompletionBoard, ConnectionPool, EventRegistry, UserDirectory, WorkerPool};

use crate::config::{ServerConfig, LOG_QUEUE_SIZE, LOG_SPLIT_LINES};
use crate::reactor::Reactor;

/// Most tasks the worker queue holds before submissions are refused.
const MAX_QUEUED_REQUESTS: usize = 10_000;

fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load()?;

    if !config.close_log {
        let queue_size = if config.async_log { LOG_QUEUE_SIZE } else { 0 };
        let sink = RotatingSink::open(&config.log_path, LOG_SPLIT_LINES, queue_size)
            .context("failed to open the log sink")?;
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "peregrine_server=debug,peregrine_core=debug".into()),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(PlainFormat)
                    .with_writer(SinkWriter::new(sink)),
            )
            .init();
    }

    info!(
        "configuration loaded: port {}, {:?} dispatch, {} workers, {} db connections",
        config.port, config.actor_model, config.worker_threads, config.db.size
    );

    let pool = Arc::new(
        ConnectionPool::connect(&config.db).context("database pool initialization failed")?,
    );
    let users = {
        let mut lease = pool.acquire();
        Arc::new(UserDirectory::load(&mut lease).context("failed to load registered users")?)
    };

    let registry = Arc::new(EventRegistry::new(config.conn_mode)?);
    let completions = Arc::new(CompletionBoard::new()?);
    let workers = WorkerPool::new(
        config.actor_model,
        Arc::clone(&pool),
        Arc::clone(&users),
        Arc::clone(&registry),
        Arc::clone(&completions),
        config.worker_threads,
        MAX_QUEUED_REQUESTS,
    )?;

    let mut reactor = Reactor::new(config, registry, workers, completions)?;
    reactor.run()?;

    pool.close();
    Ok(())
}
