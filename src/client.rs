//! RPC dispatcher and fast-path writer.
//!
//! `KvClient` turns logical requests into transmitted messages and blocks on
//! the matching response, one call at a time. The fast path bypasses the
//! request/response protocol entirely: it writes a value straight into the
//! remote database region learned from the info exchange.

use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::protocol::{Message, MessageKind, RegionDescriptor, VALUE_SIZE};
use crate::session::{Session, SessionConfig, SessionState};

/// Client handle over one session.
///
/// Strictly half-duplex: every operation takes `&mut self`, so a new request
/// cannot be issued while a prior response is outstanding.
pub struct KvClient {
    session: Session,
}

impl KvClient {
    /// Connect and perform the database-info exchange, leaving the session
    /// ready for one-sided writes.
    pub async fn connect(fabric: &dyn Fabric, config: &SessionConfig) -> Result<Self> {
        let session = Session::connect(fabric, config).await?;
        let mut client = Self::new(session);
        if let Err(e) = client.handshake().await {
            client.session.shutdown();
            return Err(e);
        }
        Ok(client)
    }

    /// Wrap an established session without performing the info exchange.
    /// Fast-path writes stay unavailable until [`KvClient::handshake`] runs.
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// The remote database descriptor, once exchanged.
    pub fn remote_db(&self) -> Option<RegionDescriptor> {
        self.session.remote_db()
    }

    /// Exchange database info with the peer. Required before fast-path
    /// writes; safe to repeat (the descriptor is overwritten).
    pub async fn handshake(&mut self) -> Result<()> {
        self.call(Message::exchange_db_info()).await?;
        Ok(())
    }

    /// Look up the value stored under `key`.
    pub async fn query(&mut self, key: i32) -> Result<(i32, i32)> {
        let resp = self.call(Message::query(key)).await?;
        Ok((resp.key, resp.value))
    }

    /// Store `value` under `key` through the request/response path.
    pub async fn set(&mut self, key: i32, value: i32) -> Result<(i32, i32)> {
        let resp = self.call(Message::set(key, value)).await?;
        Ok((resp.key, resp.value))
    }

    /// Send `Disconnect` and tear the session down. No response is awaited;
    /// teardown runs even when the send fails.
    pub async fn disconnect(mut self) -> Result<()> {
        let result = self.session.channel_mut().send(&Message::disconnect()).await;
        self.session.shutdown();
        result
    }

    /// Fast path: write `value` directly into the remote database slot for
    /// `key`, bypassing the remote request handling.
    ///
    /// The engine performs no bounds check against the remote key space; the
    /// caller owns key-range validity.
    pub async fn write_direct(&mut self, key: i32, value: i32) -> Result<()> {
        let db = self.session.remote_db().ok_or(Error::NotReady)?;
        let offset = (key as i64).wrapping_mul(VALUE_SIZE as i64);
        let remote_addr = db.base_addr.wrapping_add(offset as u64);
        self.session
            .channel_mut()
            .write(&value.to_le_bytes(), remote_addr, db.rkey)
            .await?;
        tracing::debug!(key, value, "one-sided write completed");
        Ok(())
    }

    /// One blocking request/response cycle.
    async fn call(&mut self, request: Message) -> Result<Message> {
        let expected = match request.kind {
            MessageKind::Query => MessageKind::QueryResp,
            MessageKind::Set => MessageKind::SetResp,
            MessageKind::ExchangeDbInfo => MessageKind::ExchangeDbInfo,
            other => return Err(Error::Rpc(format!("{other:?} is not a request kind"))),
        };

        self.session.channel_mut().send(&request).await?;
        let (slot, resp) = self.session.channel_mut().recv().await?;

        match resp.kind {
            MessageKind::QueryResp | MessageKind::SetResp => {
                tracing::debug!(kind = ?resp.kind, key = resp.key, value = resp.value, "got response");
                self.session.channel_mut().post_recv(slot)?;
            }
            MessageKind::ExchangeDbInfo => {
                // descriptor side effect applies whether or not this was the
                // response we asked for
                self.session.set_remote_db(resp.db_info);
                self.session.channel_mut().post_recv(slot)?;
            }
            other => {
                // protocol desync: fail the call without reposting the slot
                return Err(Error::Rpc(format!("unexpected response kind {other:?}")));
            }
        }

        if resp.kind != expected {
            return Err(Error::Rpc(format!(
                "mismatched response: expected {expected:?}, got {:?}",
                resp.kind
            )));
        }
        Ok(resp)
    }
}
