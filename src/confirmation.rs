//! Cross-chain confirmation polling.
//!
//! A registration submitted on a non-canonical chain settles onto the
//! canonical chain asynchronously; this loop watches the canonical-chain
//! predicate for the claim. Status is a pure function of the inputs and is
//! recomputed every tick, never stored independently. A transient query
//! failure never changes status by itself: remote reads fail often and must
//! not be conflated with claim failure. Polling continues past the timeout so
//! a late confirmation is still observed; the user-facing state after timeout
//! is "unverified", not blocked.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfirmationConfig;
use crate::settlement::SettlementClient;
use crate::types::{namespaced_chain_id, short_hash, ChainId, Hash256};

/// Identifier the canonical chain tracks a claim under.
///
/// Deterministic over (content hash, reporter, reported chain) so both
/// parties and the chain agree on which claim is being watched.
pub fn claim_id(content_hash: &Hash256, reporter: &str, reported_chain_id: ChainId) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(content_hash);
    hasher.update(reporter.as_bytes());
    hasher.update(namespaced_chain_id(reported_chain_id).as_bytes());
    hasher.finalize().into()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Polling disabled (submission chain is the canonical chain)
    Idle,
    /// Initial settle delay, too early to query
    Waiting,
    Polling,
    Confirmed,
    /// Max polling time elapsed without confirmation; result is unverified
    Timeout,
}

/// Pure derivation of the status from its inputs.
pub fn derive_status(
    enabled: bool,
    confirmed: bool,
    elapsed: Duration,
    config: &ConfirmationConfig,
) -> ConfirmationStatus {
    if !enabled {
        return ConfirmationStatus::Idle;
    }
    if confirmed {
        return ConfirmationStatus::Confirmed;
    }
    if elapsed.as_millis() as u64 >= config.max_polling_ms {
        return ConfirmationStatus::Timeout;
    }
    if (elapsed.as_millis() as u64) < config.settle_delay_ms {
        return ConfirmationStatus::Waiting;
    }
    ConfirmationStatus::Polling
}

#[derive(Clone, Debug)]
pub struct ConfirmationSnapshot {
    pub status: ConfirmationStatus,
    pub elapsed_ms: u64,
    pub claim_id: Hash256,
}

/// Handle to a running poll loop. Dropping the handle does not stop the
/// loop; cancellation does (session teardown cancels the parent token).
pub struct ConfirmationPoller {
    snapshot_rx: watch::Receiver<ConfirmationSnapshot>,
    cancel: CancellationToken,
}

impl ConfirmationPoller {
    /// Start polling `claim` on the canonical chain.
    pub fn spawn(
        settlement: Arc<dyn SettlementClient>,
        config: ConfirmationConfig,
        claim: Hash256,
        parent: &CancellationToken,
    ) -> ConfirmationPoller {
        let cancel = parent.child_token();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConfirmationSnapshot {
            status: ConfirmationStatus::Waiting,
            elapsed_ms: 0,
            claim_id: claim,
        });

        let token = cancel.clone();
        tokio::spawn(async move {
            poll_loop(settlement, config, claim, snapshot_tx, token).await;
        });

        ConfirmationPoller {
            snapshot_rx,
            cancel,
        }
    }

    pub fn snapshot(&self) -> ConfirmationSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfirmationSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until the status leaves `Waiting`/`Polling` for the first time:
    /// either `Confirmed`, or the first `Timeout` tick. Returns the snapshot
    /// observed; the loop keeps running after a timeout.
    pub async fn wait_for_outcome(&self) -> ConfirmationSnapshot {
        let mut rx = self.snapshot_rx.clone();
        loop {
            {
                let snapshot = rx.borrow();
                match snapshot.status {
                    ConfirmationStatus::Confirmed
                    | ConfirmationStatus::Timeout
                    | ConfirmationStatus::Idle => return snapshot.clone(),
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return self.snapshot();
            }
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    settlement: Arc<dyn SettlementClient>,
    config: ConfirmationConfig,
    claim: Hash256,
    snapshot_tx: watch::Sender<ConfirmationSnapshot>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut confirmed = false;
    let mut interval = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Settle delay before the first query: the bridge needs a moment, and a
    // premature miss looks like a failure to impatient callers
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_millis(config.settle_delay_ms)) => {}
    }

    info!("watching canonical chain for claim {}", short_hash(&claim));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("confirmation poller for {} cancelled", short_hash(&claim));
                return;
            }
            _ = interval.tick() => {}
        }

        if !confirmed {
            match settlement.is_registered(&claim).await {
                Ok(true) => {
                    confirmed = true;
                    info!("claim {} confirmed on canonical chain", short_hash(&claim));
                }
                Ok(false) => {}
                Err(e) => {
                    // Transient read failure; only elapsed time moves status
                    warn!("canonical-chain query failed: {}", e);
                }
            }
        }

        let elapsed = started.elapsed();
        let status = derive_status(true, confirmed, elapsed, &config);
        snapshot_tx.send_replace(ConfirmationSnapshot {
            status,
            elapsed_ms: elapsed.as_millis() as u64,
            claim_id: claim,
        });

        if confirmed {
            return;
        }
    }
}
