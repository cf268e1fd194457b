//! Message channel: posting fixed-size frames and reaping their completions.
//!
//! Every send and every receive is followed by a poll loop that holds the
//! calling task until the fabric reports a completion; those loops are the
//! engine's only suspension points. An optional deadline bounds each wait
//! and surfaces [`Error::Timeout`]; without one a silent peer stalls the
//! caller indefinitely.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::fabric::{Endpoint, RecvCompletion, Rkey, SendCompletion, SlotIndex, WrId};
use crate::memory::{RecvRing, SendRegion};
use crate::protocol::{Message, MESSAGE_SIZE};

pub struct MessageChannel {
    endpoint: Box<dyn Endpoint>,
    /// `None` on inline-send sessions.
    send_region: Option<SendRegion>,
    recv_ring: RecvRing,
    next_wr_id: WrId,
    poll_timeout: Option<Duration>,
}

impl MessageChannel {
    pub(crate) fn new(
        endpoint: Box<dyn Endpoint>,
        send_region: Option<SendRegion>,
        recv_ring: RecvRing,
        poll_timeout: Option<Duration>,
    ) -> Self {
        Self {
            endpoint,
            send_region,
            recv_ring,
            next_wr_id: 0,
            poll_timeout,
        }
    }

    fn next_wr_id(&mut self) -> WrId {
        self.next_wr_id += 1;
        self.next_wr_id
    }

    /// Re-arm one receive slot after its frame has been consumed.
    ///
    /// Must be called exactly once per consumed receive completion. A slot
    /// that is not reposted stops receiving; nothing heals it later.
    pub fn post_recv(&self, slot: SlotIndex) -> Result<()> {
        self.endpoint
            .post_recv(
                slot,
                self.recv_ring.handle(),
                self.recv_ring.offset_of(slot),
                MESSAGE_SIZE,
            )
            .map_err(|e| Error::Rpc(format!("failed to arm receive slot {slot}: {e}")))
    }

    /// Transmit one message and wait for its completion.
    ///
    /// Fails with [`Error::Send`] if the post is rejected at submission time
    /// or the completion reports a non-success status; neither is retried.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = msg.encode()?;
        let wr_id = self.next_wr_id();
        match &self.send_region {
            Some(region) => {
                region
                    .stage(&frame)
                    .map_err(|e| Error::Send(format!("staging failed: {e}")))?;
                self.endpoint
                    .post_send(wr_id, region.handle(), 0, frame.len())
                    .map_err(|e| Error::Send(e.to_string()))?;
            }
            None => {
                self.endpoint
                    .post_send_inline(wr_id, &frame)
                    .map_err(|e| Error::Send(e.to_string()))?;
            }
        }
        let completion = self.wait_send(wr_id).await?;
        if !completion.status.is_success() {
            return Err(Error::Send(format!(
                "completion status: {}",
                completion.status
            )));
        }
        tracing::trace!(wr_id, kind = ?msg.kind, "message sent");
        Ok(())
    }

    /// Wait for the next inbound message.
    ///
    /// The returned slot holds the decoded frame and must be reposted via
    /// [`MessageChannel::post_recv`] once the caller is done with it. On a
    /// failed completion or an undecodable frame the slot is left unarmed.
    pub async fn recv(&mut self) -> Result<(SlotIndex, Message)> {
        let completion = self.wait_recv().await?;
        if !completion.status.is_success() {
            return Err(Error::Rpc(format!(
                "receive completion failed: {}",
                completion.status
            )));
        }
        let frame = self
            .recv_ring
            .frame(completion.slot)
            .map_err(|e| Error::Rpc(format!("receive slot {}: {e}", completion.slot)))?;
        let msg = Message::decode(&frame)?;
        tracing::trace!(slot = completion.slot, kind = ?msg.kind, "message received");
        Ok((completion.slot, msg))
    }

    /// Post a one-sided write and wait for its local completion, the only
    /// confirmation a one-sided operation gets.
    pub async fn write(&mut self, payload: &[u8], remote_addr: u64, rkey: Rkey) -> Result<()> {
        let wr_id = self.next_wr_id();
        self.endpoint
            .post_write(wr_id, payload, remote_addr, rkey)
            .map_err(|e| Error::Write(e.to_string()))?;
        let completion = self.wait_send(wr_id).await?;
        if !completion.status.is_success() {
            return Err(Error::Write(format!(
                "completion status: {}",
                completion.status
            )));
        }
        Ok(())
    }

    async fn wait_send(&self, wr_id: WrId) -> Result<SendCompletion> {
        let deadline = self.poll_timeout.map(|t| (t, Instant::now() + t));
        loop {
            if let Some(completion) = self.endpoint.poll_send() {
                if completion.wr_id == wr_id {
                    return Ok(completion);
                }
                tracing::warn!(
                    wr_id = completion.wr_id,
                    "discarding stale send completion"
                );
                continue;
            }
            if let Some((timeout, at)) = deadline {
                if Instant::now() >= at {
                    return Err(Error::Timeout(timeout));
                }
            }
            tokio::task::yield_now().await;
        }
    }

    async fn wait_recv(&self) -> Result<RecvCompletion> {
        let deadline = self.poll_timeout.map(|t| (t, Instant::now() + t));
        loop {
            if let Some(completion) = self.endpoint.poll_recv() {
                return Ok(completion);
            }
            if let Some((timeout, at)) = deadline {
                if Instant::now() >= at {
                    return Err(Error::Timeout(timeout));
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Disconnect and release the channel's regions in reverse order of
    /// acquisition, handing the endpoint back for final teardown.
    pub(crate) fn release(mut self) -> Box<dyn Endpoint> {
        self.endpoint.disconnect();
        if let Some(region) = self.send_region.take() {
            if let Err(e) = self.endpoint.deregister_region(region.handle()) {
                tracing::warn!("send region deregistration failed: {e}");
            }
        }
        if let Err(e) = self.endpoint.deregister_region(self.recv_ring.handle()) {
            tracing::warn!("receive region deregistration failed: {e}");
        }
        self.endpoint
    }
}
