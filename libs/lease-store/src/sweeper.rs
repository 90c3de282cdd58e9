//! Periodic lease expiry.
//!
//! Each tick opens one transaction and expires OFFERED leases, then ACKED
//! leases, using the predicate `(now − updated_at) × 100 ≥ lifetime_ms`.
//! The ×100 factor makes an un-acked offer stale after a small fraction of
//! its lifetime. Both phases run even if one fails; their errors are
//! joined. A retention sub-phase prunes old expiration rows so released
//! addresses eventually return to the pool.
use std::time::Duration;

use lease_notify::{Action, IpFamily, LeaseNotification, Notifier};
use sqlx::sqlite::SqliteConnection;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    model::{Lease, STATE_ACKED, STATE_OFFERED},
    now_epoch, Db, StoreError,
};

/// Default seconds between sweep ticks
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// Default retention for expiration rows
pub const DEFAULT_EXPIRATION_RETENTION: Duration = Duration::from_secs(900);

/// All phase errors from one tick, joined
#[derive(Error, Debug)]
#[error("sweep failed: {0:?}")]
pub struct SweepError(pub Vec<StoreError>);

/// The expiration sweeper. Constructed with a live [`Db`] handle so it can
/// never start in a silently-idle state.
#[derive(Debug)]
pub struct Sweeper {
    db: Db,
    notifier: Notifier,
    interval: Duration,
    retention: Duration,
}

impl Sweeper {
    pub fn new(db: Db, notifier: Notifier) -> Self {
        Self {
            db,
            notifier,
            interval: DEFAULT_SWEEP_INTERVAL,
            retention: DEFAULT_EXPIRATION_RETENTION,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Tick until cancelled
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(?err, "sweep tick failed");
                    }
                }
            }
        }
    }

    /// One sweep: a single transaction covering both expiry phases and
    /// the retention prune
    #[instrument(level = "debug", skip_all)]
    pub async fn tick(&self) -> Result<(), SweepError> {
        let mut errs = Vec::new();
        let mut tx = match self.db.begin().await {
            Ok(tx) => tx,
            Err(err) => return Err(SweepError(vec![err])),
        };
        for state in [STATE_OFFERED, STATE_ACKED] {
            if let Err(err) = self.expire_state(&mut tx, state).await {
                errs.push(err);
            }
        }
        if let Err(err) = self.prune_expirations(&mut tx).await {
            errs.push(err);
        }
        if let Err(err) = tx.commit().await {
            errs.push(StoreError::from(err));
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(SweepError(errs))
        }
    }

    /// Expire all leases in `state` whose predicate holds: record an
    /// expiration row and an `expiry` notification per client lease, then
    /// delete every matching row with one DELETE. Conflict markers are
    /// removed without a record; a marker that left an expiration row
    /// would block its address permanently.
    async fn expire_state(
        &self,
        tx: &mut SqliteConnection,
        state: i64,
    ) -> Result<(), StoreError> {
        let now = now_epoch();
        let expired: Vec<Lease> = sqlx::query_as(
            "SELECT * FROM lease WHERE state = ?1 AND (?2 - updated_at) * 100 >= lifetime",
        )
        .bind(state)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        if expired.is_empty() {
            return Ok(());
        }
        for lease in &expired {
            if lease.is_conflict_marker() {
                debug!(ip = %lease.ip, "conflict marker expired");
                continue;
            }
            crate::model::insert_expiration(
                &mut *tx,
                &lease.ip,
                lease.mac_address.as_deref(),
                lease.duid.as_deref(),
                now,
            )
            .await?;
            let ip = lease.ip_addr()?;
            self.notifier
                .enqueue(LeaseNotification {
                    action: Action::Expiry,
                    ip_family: IpFamily::from(&ip),
                    ip: lease.ip.clone(),
                    mac: lease
                        .mac_address
                        .clone()
                        .or_else(|| lease.duid.clone())
                        .unwrap_or_default(),
                    timestamp: now,
                    lease_time: None,
                })
                .await?;
        }
        let deleted = sqlx::query(
            "DELETE FROM lease WHERE state = ?1 AND (?2 - updated_at) * 100 >= lifetime",
        )
        .bind(state)
        .bind(now)
        .execute(tx)
        .await?
        .rows_affected();
        debug!(state, deleted, "expired leases");
        Ok(())
    }

    /// Drop expiration rows past the retention window so their addresses
    /// become allocatable again
    async fn prune_expirations(&self, tx: &mut SqliteConnection) -> Result<(), StoreError> {
        let cutoff = now_epoch() - self.retention.as_secs() as i64;
        let pruned = sqlx::query("DELETE FROM expiration WHERE created_at < ?1")
            .bind(cutoff)
            .execute(tx)
            .await?
            .rows_affected();
        if pruned > 0 {
            debug!(pruned, "pruned expiration rows");
        }
        Ok(())
    }
}
