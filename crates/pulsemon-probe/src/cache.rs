//! Broker connection cache.
//!
//! # Purpose
//! Keeps at most one live connection per endpoint for the lifetime of the
//! monitor. A hit is returned without a liveness check; callers invalidate the
//! entry as soon as a session on it fails so the next acquire reconnects.
//!
//! # Design notes
//! Each endpoint owns an async slot lock. Acquire and invalidate of the same
//! endpoint are serialized on that lock, so concurrent sweeps never race two
//! connects to one cluster, while distinct endpoints proceed independently.
use parking_lot::Mutex;
use pulsemon_broker::{Connection, Connector, Credential, Endpoint, TrustMaterial};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::ProbeError;

type Slot = Arc<AsyncMutex<Option<Arc<dyn Connection>>>>;

pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<Endpoint, Slot>>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, endpoint: &Endpoint) -> Slot {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(endpoint.clone()).or_default())
    }

    pub async fn acquire(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        trust: &TrustMaterial,
    ) -> Result<Arc<dyn Connection>, ProbeError> {
        let slot = self.slot(endpoint);
        let mut cached = slot.lock().await;
        if let Some(connection) = cached.as_ref() {
            debug!(endpoint = %endpoint, "reusing cached broker connection");
            return Ok(Arc::clone(connection));
        }
        let connection = self
            .connector
            .connect(endpoint, credential, trust)
            .await
            .map_err(|source| ProbeError::Connection {
                endpoint: endpoint.to_string(),
                source,
            })?;
        info!(endpoint = %endpoint, "broker connection established");
        *cached = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Close and forget the connection for `endpoint`, if any.
    pub async fn invalidate(&self, endpoint: &Endpoint) {
        let slot = self.slots.lock().get(endpoint).cloned();
        let Some(slot) = slot else {
            return;
        };
        let connection = slot.lock().await.take();
        if let Some(connection) = connection {
            warn!(endpoint = %endpoint, "invalidating broker connection");
            connection.close().await;
        }
    }

    /// Number of endpoints currently holding a live connection.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().values().cloned().collect();
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }

    pub async fn contains(&self, endpoint: &Endpoint) -> bool {
        let slot = self.slots.lock().get(endpoint).cloned();
        match slot {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }
}
