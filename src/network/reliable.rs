//! Reliable delivery for messages the protocol cannot afford to lose.
//!
//! The relayed transaction hash (`AckPay`/`RegPay`) is the only thing that
//! moves the registeree forward on the relayed path; losing it strands the
//! session. One immediate attempt, then up to three retries at 1s/2s/4s,
//! then a terminal state with a manual `resend` escape hatch. The receiving
//! side dedups, so a retry after a delivered-but-unacknowledged send is safe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::RegistryError;
use crate::network::message::PeerMessage;

/// Where reliable messages go. The peer channel implements this; tests plug
/// in scripted sinks.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: &PeerMessage) -> Result<(), RegistryError>;
}

#[async_trait]
impl MessageSink for crate::network::channel::PeerChannel {
    async fn deliver(&self, message: &PeerMessage) -> Result<(), RegistryError> {
        self.send_to_partner(message).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Sending,
    /// Waiting out the backoff before retry `attempt` (1-based)
    Retrying { attempt: u32 },
    Delivered,
    /// All attempts exhausted; the message is retained for `resend`
    Failed { attempts: u32 },
}

struct Pending {
    message: Option<PeerMessage>,
    /// Token for the in-flight delivery run. Cancelling it kills the backoff
    /// timer; there is never more than one run alive.
    run: Option<CancellationToken>,
}

struct SenderInner {
    sink: Arc<dyn MessageSink>,
    config: RetryConfig,
    /// Session teardown token; runs die with it
    session_token: CancellationToken,
    state_tx: watch::Sender<DeliveryState>,
    pending: Mutex<Pending>,
}

/// Cheap-to-clone handle; all clones share the same delivery state.
#[derive(Clone)]
pub struct ReliableSender {
    inner: Arc<SenderInner>,
}

impl ReliableSender {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        config: RetryConfig,
        session_token: CancellationToken,
    ) -> ReliableSender {
        let (state_tx, _) = watch::channel(DeliveryState::Idle);
        ReliableSender {
            inner: Arc::new(SenderInner {
                sink,
                config,
                session_token,
                state_tx,
                pending: Mutex::new(Pending {
                    message: None,
                    run: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeliveryState> {
        self.inner.state_tx.subscribe()
    }

    /// Deliver `message`, retrying on failure. Replaces any delivery already
    /// in flight (its timer is cancelled first).
    pub async fn deliver(&self, message: PeerMessage) {
        let run = {
            let mut pending = self.inner.pending.lock().await;
            if let Some(previous) = pending.run.take() {
                previous.cancel();
            }
            let run = self.inner.session_token.child_token();
            pending.message = Some(message.clone());
            pending.run = Some(run.clone());
            run
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_delivery(inner, message, run).await;
        });
    }

    /// Drop the pending message and cancel any backoff timer. Used on
    /// session reset.
    pub async fn cancel_pending(&self) {
        let mut pending = self.inner.pending.lock().await;
        if let Some(run) = pending.run.take() {
            run.cancel();
        }
        pending.message = None;
        self.inner.state_tx.send_replace(DeliveryState::Idle);
    }

    /// Manual retry after exhaustion (or impatience). Cancels any pending
    /// backoff timer before attempting, so no duplicate send can race it.
    pub async fn resend(&self) -> Result<(), RegistryError> {
        let message = {
            let pending = self.inner.pending.lock().await;
            pending.message.clone()
        };
        match message {
            Some(message) => {
                self.deliver(message).await;
                Ok(())
            }
            None => Err(RegistryError::Connection("nothing to resend".to_string())),
        }
    }
}

async fn run_delivery(inner: Arc<SenderInner>, message: PeerMessage, run: CancellationToken) {
    let total_attempts = inner.config.max_retries + 1;

    for attempt in 0..total_attempts {
        if attempt == 0 {
            inner.state_tx.send_replace(DeliveryState::Sending);
        } else {
            // 1s, 2s, 4s for the default config
            let delay = Duration::from_millis(inner.config.base_delay_ms << (attempt - 1));
            inner
                .state_tx
                .send_replace(DeliveryState::Retrying { attempt });
            debug!(
                "retry {} of {} for {} in {:?}",
                attempt,
                inner.config.max_retries,
                message.kind(),
                delay
            );
            tokio::select! {
                _ = run.cancelled() => {
                    debug!("delivery run for {} cancelled", message.kind());
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if run.is_cancelled() {
            return;
        }

        match inner.sink.deliver(&message).await {
            Ok(()) => {
                let mut pending = inner.pending.lock().await;
                pending.message = None;
                pending.run = None;
                inner.state_tx.send_replace(DeliveryState::Delivered);
                debug!("{} delivered on attempt {}", message.kind(), attempt + 1);
                return;
            }
            Err(e) => {
                warn!("attempt {} for {} failed: {}", attempt + 1, message.kind(), e);
            }
        }
    }

    // Exhausted. Keep the message so resend() can try again.
    let mut pending = inner.pending.lock().await;
    pending.run = None;
    inner.state_tx.send_replace(DeliveryState::Failed {
        attempts: total_attempts,
    });
    warn!(
        "{} delivery failed after {} attempts",
        message.kind(),
        total_attempts
    );
}
