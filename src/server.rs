//! In-process KV peer: the storage side of the wire protocol.
//!
//! Used by the CLI demo and the integration tests. The database is a zeroed
//! array of 32-bit integers held in a remote-accessible region, so a peer's
//! one-sided write lands in exactly the bytes an RPC `Set` would touch.

use crate::channel::MessageChannel;
use crate::error::{Error, Result};
use crate::fabric::{Endpoint, Fabric, Listener};
use crate::memory::{RecvRing, RegionHandle, SendRegion};
use crate::protocol::{Message, MessageKind, RegionDescriptor, MESSAGE_SIZE, VALUE_SIZE};
use crate::session::{self, DEFAULT_PORT};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address.
    pub addr: String,
    /// Listen port.
    pub port: u16,
    /// Number of i32 slots in the database region.
    pub entries: usize,
    /// Symmetric send/receive queue capacity per connection.
    pub queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            entries: 1024,
            queue_depth: 1,
        }
    }
}

/// The integer-array database, stored directly in a registered region.
struct Database {
    region: RegionHandle,
    entries: usize,
}

impl Database {
    fn new(region: RegionHandle, entries: usize) -> Self {
        Self { region, entries }
    }

    fn offset_of(&self, key: i32) -> Option<usize> {
        usize::try_from(key)
            .ok()
            .filter(|k| *k < self.entries)
            .map(|k| k * VALUE_SIZE)
    }

    fn get(&self, key: i32) -> i32 {
        let Some(offset) = self.offset_of(key) else {
            tracing::warn!(key, "query outside the database range");
            return 0;
        };
        match self.region.read_at(offset, VALUE_SIZE) {
            Ok(bytes) => {
                let mut value = [0u8; VALUE_SIZE];
                value.copy_from_slice(&bytes);
                i32::from_le_bytes(value)
            }
            Err(e) => {
                tracing::warn!(key, "database read failed: {e}");
                0
            }
        }
    }

    fn set(&self, key: i32, value: i32) {
        let Some(offset) = self.offset_of(key) else {
            tracing::warn!(key, "set outside the database range, not stored");
            return;
        };
        if let Err(e) = self.region.write_at(offset, &value.to_le_bytes()) {
            tracing::warn!(key, "database write failed: {e}");
        }
    }
}

/// KV peer serving one connection at a time over an injected fabric.
pub struct DbServer {
    listener: Box<dyn Listener>,
    config: ServerConfig,
}

impl DbServer {
    /// Bind the listen address. Binding up front lets callers connect as
    /// soon as this returns, even before [`DbServer::run`] is polled.
    pub fn bind(fabric: &dyn Fabric, config: ServerConfig) -> Result<Self> {
        let local = session::resolve(&config.addr, config.port)?;
        let listener = fabric
            .bind(local)
            .map_err(|e| Error::Connect(e.to_string()))?;
        tracing::info!(addr = %local, entries = config.entries, "kv peer listening");
        Ok(Self { listener, config })
    }

    /// Accept and serve connections until the task is dropped.
    pub async fn run(self) -> Result<()> {
        loop {
            let endpoint = loop {
                if let Some(endpoint) = self.listener.try_accept() {
                    break endpoint;
                }
                tokio::task::yield_now().await;
            };
            tracing::debug!("connection accepted");
            if let Err(e) = self.serve(endpoint).await {
                tracing::warn!("connection ended with error: {e}");
            }
        }
    }

    async fn serve(&self, endpoint: Box<dyn Endpoint>) -> Result<()> {
        // the database region comes first: its descriptor answers
        // info-exchange requests for the lifetime of the connection
        let db_region = match endpoint.register_region(self.config.entries * VALUE_SIZE, true) {
            Ok(region) => region,
            Err(e) => {
                drop(endpoint);
                return Err(Error::Registration(format!("database region: {e}")));
            }
        };
        let descriptor = match db_region.descriptor() {
            Some(descriptor) => descriptor,
            None => {
                release_partial(endpoint, &[&db_region]);
                return Err(Error::Registration(
                    "database region carries no remote descriptor".to_string(),
                ));
            }
        };

        let recv_region =
            match endpoint.register_region(self.config.queue_depth * MESSAGE_SIZE, false) {
                Ok(region) => region,
                Err(e) => {
                    release_partial(endpoint, &[&db_region]);
                    return Err(Error::Registration(format!("receive region: {e}")));
                }
            };
        let send_region = match endpoint.register_region(MESSAGE_SIZE, false) {
            Ok(region) => region,
            Err(e) => {
                release_partial(endpoint, &[&recv_region, &db_region]);
                return Err(Error::Registration(format!("send region: {e}")));
            }
        };

        let recv_ring = RecvRing::new(recv_region, self.config.queue_depth);
        for slot in 0..recv_ring.slots() {
            if let Err(e) = endpoint.post_recv(
                slot,
                recv_ring.handle(),
                recv_ring.offset_of(slot),
                MESSAGE_SIZE,
            ) {
                release_partial(endpoint, &[&send_region, recv_ring.handle(), &db_region]);
                return Err(Error::Connect(format!(
                    "failed to arm receive slot {slot}: {e}"
                )));
            }
        }

        // buffers are armed; let the peer's connect complete
        while !endpoint
            .poll_connect()
            .map_err(|e| Error::Connect(e.to_string()))?
        {
            tokio::task::yield_now().await;
        }

        let database = Database::new(db_region.clone(), self.config.entries);
        let mut channel =
            MessageChannel::new(endpoint, Some(SendRegion::new(send_region)), recv_ring, None);

        let result = Self::request_loop(&database, descriptor, &mut channel).await;

        let endpoint = channel.release();
        if let Err(e) = endpoint.deregister_region(&db_region) {
            tracing::warn!("database region deregistration failed: {e}");
        }
        drop(endpoint);
        result
    }

    async fn request_loop(
        database: &Database,
        descriptor: RegionDescriptor,
        channel: &mut MessageChannel,
    ) -> Result<()> {
        loop {
            let (slot, request) = channel.recv().await?;
            let response = match request.kind {
                MessageKind::Query => {
                    let value = database.get(request.key);
                    tracing::debug!(key = request.key, value, "query");
                    Some(Message::query_resp(request.key, value))
                }
                MessageKind::Set => {
                    database.set(request.key, request.value);
                    tracing::debug!(key = request.key, value = request.value, "set");
                    Some(Message::set_resp(request.key, request.value))
                }
                MessageKind::ExchangeDbInfo => {
                    tracing::debug!("database info exchange");
                    Some(Message::db_info_resp(descriptor))
                }
                MessageKind::Disconnect => None,
                other => {
                    tracing::warn!(kind = ?other, "ignoring unexpected message");
                    channel.post_recv(slot)?;
                    continue;
                }
            };
            match response {
                Some(msg) => {
                    // re-arm before responding so the next request has a
                    // buffer waiting
                    channel.post_recv(slot)?;
                    channel.send(&msg).await?;
                }
                None => {
                    tracing::debug!("disconnect requested");
                    return Ok(());
                }
            }
        }
    }
}

/// Deregister `regions` (listed most-recent-first), then destroy the
/// endpoint.
fn release_partial(endpoint: Box<dyn Endpoint>, regions: &[&RegionHandle]) {
    for region in regions {
        if let Err(e) = endpoint.deregister_region(region) {
            tracing::warn!("deregistration during teardown failed: {e}");
        }
    }
    drop(endpoint);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn database(entries: usize) -> Database {
        let region = RegionHandle::new(
            1,
            Arc::new(Mutex::new(vec![0u8; entries * VALUE_SIZE])),
            None,
        );
        Database::new(region, entries)
    }

    #[test]
    fn test_database_set_get() {
        let db = database(8);
        assert_eq!(db.get(3), 0);
        db.set(3, -77);
        assert_eq!(db.get(3), -77);
        db.set(0, i32::MAX);
        assert_eq!(db.get(0), i32::MAX);
    }

    #[test]
    fn test_database_out_of_range_keys() {
        let db = database(4);
        db.set(4, 1);
        db.set(-1, 1);
        assert_eq!(db.get(4), 0);
        assert_eq!(db.get(-1), 0);
        // in-range entries are untouched
        for key in 0..4 {
            assert_eq!(db.get(key), 0);
        }
    }

    #[test]
    fn test_database_values_live_in_region_bytes() {
        let db = database(4);
        db.set(2, 0x0102_0304);
        let raw = db.region.read_at(2 * VALUE_SIZE, VALUE_SIZE).unwrap();
        assert_eq!(raw, 0x0102_0304i32.to_le_bytes());
    }
}
