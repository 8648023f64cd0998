//! Relay Runtime
//!
//! Wires configuration, state, the Redis bridge and the enrichment client
//! together, then drains inbound messages on a single task until Ctrl+C or
//! until the inbound source ends.

use chrono::Utc;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::blacklist::{Blacklist, BlacklistError};
use crate::config::{Config, ConfigError};
use crate::enrichment::{DexScreenerClient, Enricher};
use crate::forwarder::{ForwardError, Forwarder, RedisForwarder};
use crate::pipeline::{Pipeline, PipelineState, PipelineStats};
use crate::source::{
    InboundMessage, MessageSource, RedisSource, SourceConfig, SourceError, SourceList,
};
use crate::txlog::{TransactionLog, TxLogError};

/// Capacity of the inbound message queue
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Fatal relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Blacklist(#[from] BlacklistError),

    #[error(transparent)]
    TxLog(#[from] TxLogError),

    #[error("Failed to connect outbound bridge: {0}")]
    Forward(#[from] ForwardError),

    #[error("Inbound bridge stopped: {0}")]
    Source(#[from] SourceError),
}

/// Load persisted state for a fresh run, stamping the epoch now
pub fn build_state(config: &Config) -> Result<PipelineState, RelayError> {
    let blacklist = Blacklist::load(&config.blacklist_path)?;
    let transactions = TransactionLog::open(&config.transactions_path)?;

    match transactions.records() {
        Ok(records) => info!(
            "Transaction log {} has {} previous entries",
            transactions.path().display(),
            records.len()
        ),
        Err(e) => warn!("Could not read transaction log history: {}", e),
    }

    let sources = SourceList::new(&config.sources);
    if sources.is_empty() {
        warn!("No sources configured, every message will be ignored");
    } else {
        info!("Watching {} sources", sources.len());
    }

    Ok(PipelineState::new(Utc::now(), sources, blacklist, transactions))
}

/// Log the loaded configuration with the credential masked
pub fn log_config(config: &Config) {
    info!(
        "Loaded configuration: api_id={} api_hash={} destination={} sources={:?}",
        config.api_id,
        config.masked_api_hash(),
        config.destination,
        config.sources
    );
}

/// Feed messages from `rx` through `pipeline` until `shutdown` resolves or
/// the channel closes
pub async fn drain<F, E, S>(
    pipeline: &mut Pipeline<F, E>,
    rx: &mut mpsc::Receiver<InboundMessage>,
    shutdown: S,
) -> PipelineStats
where
    F: Forwarder,
    E: Enricher,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(message) => {
                    pipeline.handle(&message).await;
                }
                None => {
                    warn!("Inbound stream ended");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    pipeline.stats()
}

/// Stop the inbound source task and surface the error it ended with
///
/// A task still running at shutdown is cancelled and counts as a clean stop.
pub async fn finish_source(task: JoinHandle<Result<(), SourceError>>) -> Result<(), RelayError> {
    task.abort();
    match task.await {
        Ok(result) => result.map_err(RelayError::from),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            error!("Inbound source task failed: {}", e);
            Ok(())
        }
    }
}

/// Run the relay with `config` until shutdown
pub async fn run(config: Config) -> Result<PipelineStats, RelayError> {
    log_config(&config);

    let state = build_state(&config)?;
    let forwarder =
        RedisForwarder::connect(&config.redis_url, config.outbound_channel.clone()).await?;
    info!(
        "Forwarding to {} via channel {}",
        config.destination,
        forwarder.channel()
    );

    let enricher = DexScreenerClient::new(config.enrichment_url.clone());
    info!("Enriching via {}", enricher.search_url());
    let mut pipeline = Pipeline::new(state, forwarder, enricher, config.destination.clone())
        .with_alert(config.alert);

    let source = RedisSource::new(SourceConfig::new(
        config.redis_url.clone(),
        config.inbound_channel.clone(),
    ));
    let (tx, mut rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let source_task = tokio::spawn(async move { source.run(tx).await });

    info!("Listening for new messages...");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let stats = drain(&mut pipeline, &mut rx, shutdown).await;

    info!(
        "Final statistics: received={} accepted={} forwarded={} suppressed={} no_identifier={}",
        stats.received, stats.accepted, stats.forwarded, stats.suppressed, stats.no_identifier
    );

    if let Err(e) = finish_source(source_task).await {
        error!("{}", e);
        return Err(e);
    }
    Ok(stats)
}
