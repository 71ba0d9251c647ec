//! Owns the single active transport of a connection.

use super::{
    Transport, TransportEvent, TransportEvents, TransportFactory, TransportKind, TransportParams,
};
use crate::error::McpResult;
use mcplink_auth::AuthProvider;
use mcplink_util::{LogLevel, SessionLog};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Builds transports on demand and keeps at most one of them alive.
///
/// Each transport is created with a fresh generation number; its events are
/// tagged with it so the connection can ignore events from a transport that
/// has since been replaced.
pub struct TransportSelector {
    factory: Arc<dyn TransportFactory>,
    active: Mutex<Option<(u64, Arc<dyn Transport>)>>,
    generation: AtomicU64,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    log: Arc<SessionLog>,
}

impl TransportSelector {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
        log: Arc<SessionLog>,
    ) -> Self {
        Self {
            factory,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            events_tx,
            log,
        }
    }

    /// Close the current transport, if any, then build a new one of `kind`.
    ///
    /// The generation is bumped before the old transport is closed, so its
    /// close event is already stale when it arrives. Returns the new
    /// transport with its generation.
    pub async fn create_transport(
        &self,
        kind: TransportKind,
        url: &str,
        auth: Option<Arc<dyn AuthProvider>>,
        headers: &HashMap<String, String>,
        request_timeout: Duration,
    ) -> McpResult<(u64, Arc<dyn Transport>)> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut active = self.active.lock().await;
        if let Some((_, previous)) = active.take() {
            self.close_quietly(previous).await;
        }

        self.log.log(
            LogLevel::Debug,
            format!("Creating {} transport for {url}", kind.label()),
        );
        let transport = self.factory.create(
            kind,
            TransportParams {
                url: url.to_string(),
                headers: headers.clone(),
                auth,
                request_timeout,
                events: TransportEvents::new(generation, self.events_tx.clone()),
            },
        )?;
        *active = Some((generation, transport.clone()));
        Ok((generation, transport))
    }

    /// Close and forget the active transport.
    pub async fn close_active(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let previous = self.active.lock().await.take();
        if let Some((_, previous)) = previous {
            self.close_quietly(previous).await;
        }
    }

    /// Close the active transport only if it is still the one created as
    /// `generation`. Returns whether it was.
    pub async fn close_generation(&self, generation: u64) -> bool {
        let previous = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some((current, _)) if *current == generation => {
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    active.take()
                }
                _ => None,
            }
        };
        match previous {
            Some((_, previous)) => {
                self.close_quietly(previous).await;
                true
            }
            None => false,
        }
    }

    /// Generation of the most recently created transport.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn active(&self) -> Option<Arc<dyn Transport>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|(_, transport)| transport.clone())
    }

    async fn close_quietly(&self, transport: Arc<dyn Transport>) {
        if let Err(e) = transport.close().await {
            self.log.log_with(
                LogLevel::Warn,
                &format!("Error closing previous {} transport:", transport.kind().label()),
                [e],
            );
        }
    }
}

impl std::fmt::Debug for TransportSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSelector")
            .field("generation", &self.generation())
            .finish()
    }
}
