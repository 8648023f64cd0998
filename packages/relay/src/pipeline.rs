//! Event Pipeline
//!
//! Drives one inbound message at a time through the filters and, for a fresh
//! identifier, the commit actions:
//!
//! 1. epoch filter (messages dated before startup are ignored)
//! 2. source allow-list
//! 3. identifier extraction
//! 4. persistent blacklist
//! 5. session dedup set
//! 6. mark sent, forward, blacklist, enrich, log
//!
//! Commit actions are best-effort: a failure is logged and the remaining
//! actions still run.

use chrono::{DateTime, Local, Utc};
use std::collections::HashSet;
use std::io::Write;
use tracing::{debug, error, info, warn};

use crate::blacklist::Blacklist;
use crate::enrichment::{enrich, Enricher, RetryPolicy};
use crate::extractor::extract;
use crate::forwarder::Forwarder;
use crate::source::{InboundMessage, SourceList};
use crate::txlog::{TransactionLog, TransactionRecord};

/// All mutable relay state, owned by the pipeline for the process lifetime
#[derive(Debug)]
pub struct PipelineState {
    /// Messages dated before this are backlog and ignored
    pub epoch: DateTime<Utc>,
    pub sources: SourceList,
    /// Identifiers forwarded during this run
    pub sent: HashSet<String>,
    pub blacklist: Blacklist,
    pub transactions: TransactionLog,
}

impl PipelineState {
    pub fn new(
        epoch: DateTime<Utc>,
        sources: SourceList,
        blacklist: Blacklist,
        transactions: TransactionLog,
    ) -> Self {
        Self {
            epoch,
            sources,
            sent: HashSet::new(),
            blacklist,
            transactions,
        }
    }
}

/// What the pipeline did with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Dated before the process epoch
    Stale,
    /// Chat not in the source list, or chat could not be resolved
    UnknownSource,
    /// No identifier in the text
    NoIdentifier,
    Blacklisted(String),
    /// Already forwarded this session
    AlreadySent(String),
    Forwarded(ForwardReport),
}

/// Result of the commit actions for a fresh identifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReport {
    pub ca: String,
    pub sender: String,
    pub forwarded: bool,
    pub blacklisted: bool,
    /// Enrichment addresses added to the blacklist
    pub enriched: Vec<String>,
    pub logged: bool,
}

/// Running totals, reported on shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub accepted: u64,
    pub forwarded: u64,
    pub suppressed: u64,
    pub no_identifier: u64,
}

/// The relay core
pub struct Pipeline<F, E> {
    state: PipelineState,
    forwarder: F,
    enricher: E,
    retry: RetryPolicy,
    destination: String,
    alert: bool,
    stats: PipelineStats,
}

impl<F: Forwarder, E: Enricher> Pipeline<F, E> {
    pub fn new(
        state: PipelineState,
        forwarder: F,
        enricher: E,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            state,
            forwarder,
            enricher,
            retry: RetryPolicy::default(),
            destination: destination.into(),
            alert: false,
            stats: PipelineStats::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ring the terminal bell after each forward
    pub fn with_alert(mut self, alert: bool) -> Self {
        self.alert = alert;
        self
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Process one inbound message
    pub async fn handle(&mut self, message: &InboundMessage) -> Outcome {
        self.stats.received += 1;

        if message.date < self.state.epoch {
            return Outcome::Stale;
        }

        let chat = match message.resolve_chat() {
            Ok(chat) => Some(chat),
            Err(e) => {
                warn!("Error getting chat info: {}", e);
                None
            }
        };
        let chat = match chat {
            Some(chat) if self.state.sources.matches(chat) => chat,
            _ => return Outcome::UnknownSource,
        };

        self.stats.accepted += 1;
        let now = Local::now();
        info!("Received message from: {}", chat.username_or_id());

        let Some(extraction) = extract(&message.text) else {
            self.stats.no_identifier += 1;
            info!("No CA found in the message");
            return Outcome::NoIdentifier;
        };
        debug!("Matched {} rule", extraction.rule.name());
        let ca = extraction.ca;

        if self.state.blacklist.contains(&ca) {
            self.stats.suppressed += 1;
            warn!("CA {} blacklisted, ignoring", ca);
            return Outcome::Blacklisted(ca);
        }

        if self.state.sent.contains(&ca) {
            self.stats.suppressed += 1;
            warn!("CA already sent: {}, not forwarding", ca);
            return Outcome::AlreadySent(ca);
        }

        let report = self.commit(ca, chat.display_name(), now).await;
        Outcome::Forwarded(report)
    }

    async fn commit(&mut self, ca: String, sender: String, at: DateTime<Local>) -> ForwardReport {
        let mut report = ForwardReport {
            ca: ca.clone(),
            sender: sender.clone(),
            ..Default::default()
        };

        // Marked before the send so a rapid duplicate cannot slip through
        self.state.sent.insert(ca.clone());

        info!("CA: {} ({}) forwarding to {}", ca, sender, self.destination);
        match self.forwarder.send(&self.destination, &ca).await {
            Ok(()) => {
                report.forwarded = true;
                self.stats.forwarded += 1;
                if self.alert {
                    ring_bell();
                }
            }
            Err(e) => error!("Failed to forward {}: {}", ca, e),
        }

        if !self.state.blacklist.contains(&ca) {
            match self.state.blacklist.add(&ca) {
                Ok(_) => report.blacklisted = true,
                Err(e) => error!("{}", e),
            }
        }

        let info = enrich(&self.enricher, &self.retry, &ca).await;
        if info.is_empty() {
            warn!("No enrichment data for {}", ca);
        }
        for address in info.addresses() {
            if self.state.blacklist.contains(&address) {
                continue;
            }
            match self.state.blacklist.add(&address) {
                Ok(_) => report.enriched.push(address),
                Err(e) => error!("{}", e),
            }
        }

        let record = TransactionRecord::new(sender, ca, at);
        match self.state.transactions.append(&record) {
            Ok(()) => report.logged = true,
            Err(e) => error!("Failed to log transaction: {}", e),
        }

        info!("Waiting on transaction...");
        report
    }
}

fn ring_bell() {
    let mut stderr = std::io::stderr();
    // Bell write errors are ignored
    let _ = stderr.write_all(b"\x07").and_then(|_| stderr.flush());
}
