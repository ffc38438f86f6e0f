//! Message-kind keyed handler registry.
//!
//! Each role installs its own defaults (the registeree listens for receipts
//! and relayed hashes, the relayer for signatures; both handle Connect).
//! Registration is last-wins so tests can override a single kind with an
//! instrumented handler. Dispatch runs one handler to completion per message;
//! the drain loop above it is sequential, so handlers for the same kind never
//! interleave within a session.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::network::message::{MessageKind, PeerMessage};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: PeerMessage) -> Result<(), RegistryError>;
}

/// Adapter so plain async closures can be registered.
struct FnHandler<F, Fut> {
    f: F,
    _future: std::marker::PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(PeerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), RegistryError>> + Send,
{
    async fn handle(&self, message: PeerMessage) -> Result<(), RegistryError> {
        (self.f)(message).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(PeerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RegistryError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _future: std::marker::PhantomData,
    })
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<MessageKind, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Install a handler for `kind`. Replaces any existing one (last
    /// registration wins).
    pub async fn register(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        if self
            .handlers
            .write()
            .await
            .insert(kind, handler)
            .is_some()
        {
            debug!("handler for {} replaced", kind);
        }
    }

    pub async fn registered_kinds(&self) -> Vec<MessageKind> {
        self.handlers.read().await.keys().copied().collect()
    }

    /// Invoke the handler for `message` exactly once, to completion.
    ///
    /// A kind this role never registered is ignored with a log line; handler
    /// errors are surfaced to the caller for logging, never for dispatch
    /// retries (the sender owns retries).
    pub async fn dispatch(&self, message: PeerMessage) -> Result<(), RegistryError> {
        let kind = message.kind();
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&kind).cloned()
        };

        match handler {
            Some(handler) => handler.handle(message).await,
            None => {
                debug!("no handler for {} in this role; ignoring", kind);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::ReceiptPayload;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn receipt() -> PeerMessage {
        PeerMessage::AckRec(ReceiptPayload {
            success: true,
            message: "ok".to_string(),
        })
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler_once() {
        let registry = HandlerRegistry::new();
        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        registry
            .register(
                MessageKind::AckRec,
                handler_fn(move |_| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;

        registry.dispatch(receipt()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhandled_kind_ignored() {
        let registry = HandlerRegistry::new();
        assert!(registry.dispatch(receipt()).await.is_ok());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = HandlerRegistry::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let hits = Arc::clone(&first);
        registry
            .register(
                MessageKind::AckRec,
                handler_fn(move |_| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;

        let hits = Arc::clone(&second);
        registry
            .register(
                MessageKind::AckRec,
                handler_fn(move |_| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;

        registry.dispatch(receipt()).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
