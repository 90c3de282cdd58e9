//! # lease-notify
//!
//! Buffered, retried delivery of lease events to the region controller.
//!
//! [`Notifier`] is the cheap cloneable handle the allocator and sweeper use
//! to enqueue [`LeaseNotification`]s. A [`Flusher`] task drains the queue in
//! batches and POSTs them as a JSON array. Delivery is at-least-once: a batch
//! is retried with exponential backoff and only dropped (with a warning)
//! after `max_retries` failed attempts. The controller de-duplicates on
//! `(ip, mac, timestamp, action)`.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default seconds between flushes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Default max notifications per POST
pub const DEFAULT_MAX_BATCH: usize = 256;
/// Default attempts before a batch is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default POST timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default queue capacity. Enqueue suspends when this is full.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;
/// Backoff cap exponent: sleep maxes out at `flush_interval * 2^6`
const MAX_BACKOFF_EXP: u32 = 6;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("controller returned non-2xx status {0}")]
    FailedToPost(reqwest::StatusCode),
    #[error("transport error")]
    Transport(#[from] reqwest::Error),
    #[error("notification queue is closed")]
    QueueClosed,
}

/// What happened to the lease
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Commit,
    Release,
    Expiry,
}

/// Address family of the leased IP
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    Ipv4,
    Ipv6,
}

impl From<&IpAddr> for IpFamily {
    fn from(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::Ipv4,
            IpAddr::V6(_) => IpFamily::Ipv6,
        }
    }
}

/// One lease event, serialized into the JSON array POSTed upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseNotification {
    pub action: Action,
    pub ip_family: IpFamily,
    pub ip: String,
    pub mac: String,
    /// epoch seconds at the time of the event
    pub timestamp: i64,
    /// lease duration in seconds, present on commit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_time: Option<u32>,
}

/// Reporter tunables
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// full URL notifications are POSTed to
    pub endpoint: String,
    pub flush_interval: Duration,
    pub max_batch: usize,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub queue_size: usize,
}

impl NotifyConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch: DEFAULT_MAX_BATCH,
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// Handle used to push notifications onto the queue
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<LeaseNotification>,
}

impl Notifier {
    /// Append a notification. Never waits on network I/O; suspends only
    /// when the bounded queue itself is full.
    pub async fn enqueue(&self, note: LeaseNotification) -> Result<(), NotifyError> {
        trace!(?note, "enqueueing lease notification");
        self.tx.send(note).await.map_err(|_| NotifyError::QueueClosed)
    }
}

/// Bare bounded queue with no flusher attached. Useful when the consumer
/// is not an HTTP endpoint (tests, embedding).
pub fn queue(size: usize) -> (Notifier, mpsc::Receiver<LeaseNotification>) {
    let (tx, rx) = mpsc::channel(size);
    (Notifier { tx }, rx)
}

/// Create the notifier handle and its background flusher
pub fn channel(cfg: NotifyConfig) -> Result<(Notifier, Flusher), NotifyError> {
    let (notifier, rx) = queue(cfg.queue_size);
    let client = reqwest::Client::builder()
        .timeout(cfg.request_timeout)
        .build()?;
    Ok((notifier, Flusher { rx, client, cfg }))
}

/// Background task that drains the queue and POSTs batches
pub struct Flusher {
    rx: mpsc::Receiver<LeaseNotification>,
    client: reqwest::Client,
    cfg: NotifyConfig,
}

impl std::fmt::Debug for Flusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flusher").field("cfg", &self.cfg).finish()
    }
}

impl Flusher {
    /// Run until cancelled or all `Notifier` handles drop. A final flush is
    /// attempted (without retries) on shutdown.
    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut batch: Vec<LeaseNotification> = Vec::with_capacity(self.cfg.max_batch);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(pending = batch.len(), "reporter shutting down");
                    if !batch.is_empty() {
                        if let Err(err) = self.post(&batch).await {
                            warn!(?err, dropped = batch.len(), "final flush failed");
                        }
                    }
                    return;
                }
                maybe = self.rx.recv() => match maybe {
                    Some(note) => {
                        batch.push(note);
                        if batch.len() >= self.cfg.max_batch {
                            self.post_with_retry(&mut batch, &token).await;
                            ticker.reset();
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            self.post_with_retry(&mut batch, &token).await;
                        }
                        debug!("all notifier handles dropped, reporter exiting");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.post_with_retry(&mut batch, &token).await;
                    }
                }
            }
        }
    }

    /// One POST attempt for the batch
    async fn post(&self, batch: &[LeaseNotification]) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.cfg.endpoint)
            .json(batch)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::FailedToPost(status));
        }
        Ok(())
    }

    /// POST the batch, retrying with capped exponential backoff. The batch
    /// is cleared whether it was delivered or dropped.
    async fn post_with_retry(&self, batch: &mut Vec<LeaseNotification>, token: &CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            match self.post(batch).await {
                Ok(()) => {
                    debug!(count = batch.len(), "posted lease notifications");
                    batch.clear();
                    return;
                }
                Err(err) if attempt >= self.cfg.max_retries => {
                    warn!(?err, dropped = batch.len(), attempt, "giving up on batch");
                    batch.clear();
                    return;
                }
                Err(err) => {
                    let backoff = self
                        .cfg
                        .flush_interval
                        .saturating_mul(1 << attempt.min(MAX_BACKOFF_EXP));
                    warn!(?err, attempt, ?backoff, "notification POST failed, backing off");
                    attempt += 1;
                    tokio::select! {
                        _ = token.cancelled() => {
                            warn!(dropped = batch.len(), "cancelled during backoff");
                            batch.clear();
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}
