//! Service registry and method dispatch

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::stream::MsgStream;
use crate::{Error, Result};

/// User code invoked by the mux for a matching service and method.
///
/// Code generation produces one concrete handler object per service; the mux
/// only needs the identifiers and a dispatch entry point.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Fully-qualified service identifier, e.g. `"echo.Echo"`.
    fn service_id(&self) -> &str;

    /// Bare method names served by this handler.
    fn method_ids(&self) -> &[&str];

    /// Invoke `method_id` with the call's stream. Returns `Ok(false)` when
    /// the method is not recognized, without touching the stream.
    async fn invoke_method(
        &self,
        service_id: &str,
        method_id: &str,
        stream: MsgStream,
    ) -> Result<bool>;
}

/// Registry mapping service IDs to handlers.
///
/// The handler map is read-mostly; registration happens at startup and
/// lookups happen per call.
#[derive(Default)]
pub struct Mux {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Mux {
    /// Create an empty mux.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its service ID. A second registration under
    /// the same ID fails.
    pub async fn register(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let service_id = handler.service_id().to_string();
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&service_id) {
            return Err(Error::AlreadyRegistered(service_id));
        }
        debug!("registered handler for service: {}", service_id);
        handlers.insert(service_id, handler);
        Ok(())
    }

    /// Dispatch a call to the matching handler.
    ///
    /// An empty `service_id` scans all handlers and invokes the first whose
    /// method list contains `method_id`, supporting callers that omit the
    /// service name. Returns `Ok(false)` when nothing matches; the server
    /// turns that into the unimplemented error.
    pub async fn invoke_method(
        &self,
        service_id: &str,
        method_id: &str,
        stream: MsgStream,
    ) -> Result<bool> {
        let handler = {
            let handlers = self.handlers.read().await;
            if service_id.is_empty() {
                handlers
                    .values()
                    .find(|h| h.method_ids().contains(&method_id))
                    .cloned()
            } else {
                handlers.get(service_id).cloned()
            }
        };

        match handler {
            Some(handler) => handler.invoke_method(service_id, method_id, stream).await,
            None => Ok(false),
        }
    }

    /// Number of registered services.
    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// True when no services are registered.
    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}
