//! In-process loopback fabric.
//!
//! The default backend, playing the role a mock transport plays for testing
//! without RDMA hardware, but with real delivery semantics: a send lands
//! only in a receive slot the peer has armed, one-sided writes are validated
//! against the exposed-region registry, and every posted operation reports
//! its outcome through a completion queue. Fault injection and an event log
//! let tests drive failure paths and assert teardown ordering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::fabric::{
    CompletionStatus, Endpoint, EndpointAttrs, Fabric, FabricError, Listener, Lkey,
    RecvCompletion, Rkey, SendCompletion, SlotIndex, WrId,
};
use crate::memory::RegionHandle;
use crate::protocol::RegionDescriptor;

/// Most regions one endpoint may hold registered at a time.
const MAX_REGIONS: usize = 32;

/// Observable fabric-level events, recorded for assertions on teardown
/// ordering and one-sided write targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FabricEvent {
    EndpointCreated { id: u64 },
    EndpointDestroyed { id: u64 },
    RegionRegistered { lkey: Lkey },
    RegionDeregistered { lkey: Lkey },
    WriteIssued { remote_addr: u64, rkey: Rkey, len: usize },
}

#[derive(Default)]
struct Faults {
    /// Complete the next posted send or write with `LocalFailure`.
    fail_next_send: bool,
    /// Fail the n-th upcoming region registration; counts down per attempt.
    fail_registration_in: Option<usize>,
}

/// A region some endpoint exposed for one-sided writes.
struct ExposedRegion {
    base_addr: u64,
    buf: Arc<Mutex<Vec<u8>>>,
}

#[derive(Default)]
struct ListenerShared {
    pending: SegQueue<LoopbackEndpoint>,
}

/// State shared by every endpoint and listener of one fabric instance.
struct Hub {
    listeners: Mutex<HashMap<SocketAddr, Arc<ListenerShared>>>,
    exposed: DashMap<Rkey, ExposedRegion>,
    events: Mutex<Vec<FabricEvent>>,
    faults: Mutex<Faults>,
    next_key: AtomicU32,
    next_endpoint: AtomicU64,
}

impl Hub {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            exposed: DashMap::new(),
            events: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            next_key: AtomicU32::new(1),
            next_endpoint: AtomicU64::new(1),
        }
    }

    fn record(&self, event: FabricEvent) {
        self.events.lock().push(event);
    }

    fn one_sided_write(&self, remote_addr: u64, rkey: Rkey, payload: &[u8]) -> CompletionStatus {
        let Some(entry) = self.exposed.get(&rkey) else {
            tracing::warn!(rkey, "one-sided write with unknown rkey");
            return CompletionStatus::RemoteAccess;
        };
        let Some(offset) = remote_addr
            .checked_sub(entry.base_addr)
            .and_then(|off| usize::try_from(off).ok())
        else {
            return CompletionStatus::RemoteAccess;
        };
        let mut buf = entry.buf.lock();
        let Some(end) = offset
            .checked_add(payload.len())
            .filter(|end| *end <= buf.len())
        else {
            tracing::warn!(remote_addr, rkey, "one-sided write out of region bounds");
            return CompletionStatus::RemoteAccess;
        };
        buf[offset..end].copy_from_slice(payload);
        CompletionStatus::Success
    }
}

/// Queue-pair state shared with the peer endpoint.
struct EpShared {
    armed: SegQueue<ArmedRecv>,
    send_cq: SegQueue<SendCompletion>,
    recv_cq: SegQueue<RecvCompletion>,
    peer: Mutex<Weak<EpShared>>,
    established: AtomicBool,
}

impl EpShared {
    fn new() -> Self {
        Self {
            armed: SegQueue::new(),
            send_cq: SegQueue::new(),
            recv_cq: SegQueue::new(),
            peer: Mutex::new(Weak::new()),
            established: AtomicBool::new(false),
        }
    }
}

/// One armed receive buffer, consumed in post order.
struct ArmedRecv {
    slot: SlotIndex,
    buf: Arc<Mutex<Vec<u8>>>,
    offset: usize,
    len: usize,
}

/// Loopback endpoint. Created outbound by [`LoopbackFabric::create_endpoint`]
/// or inbound by [`Listener::try_accept`].
pub struct LoopbackEndpoint {
    id: u64,
    hub: Arc<Hub>,
    attrs: EndpointAttrs,
    /// Connect target; `None` on accepted (passive) endpoints.
    target: Option<SocketAddr>,
    requested: AtomicBool,
    shared: Arc<EpShared>,
    /// Live registrations: local key plus the exposed rkey, if any.
    regions: Mutex<Vec<(Lkey, Option<Rkey>)>>,
}

impl LoopbackEndpoint {
    fn new(hub: Arc<Hub>, attrs: EndpointAttrs, target: Option<SocketAddr>) -> Self {
        Self {
            id: hub.next_endpoint.fetch_add(1, Ordering::Relaxed),
            hub,
            attrs,
            target,
            requested: AtomicBool::new(false),
            shared: Arc::new(EpShared::new()),
            regions: Mutex::new(Vec::new()),
        }
    }

    fn complete_send(&self, wr_id: WrId, status: CompletionStatus) {
        self.shared.send_cq.push(SendCompletion { wr_id, status });
    }

    fn take_send_fault(&self) -> bool {
        std::mem::take(&mut self.hub.faults.lock().fail_next_send)
    }

    fn deliver(&self, wr_id: WrId, payload: Bytes) -> Result<(), FabricError> {
        if self.take_send_fault() {
            self.complete_send(wr_id, CompletionStatus::LocalFailure);
            return Ok(());
        }
        if !self.shared.established.load(Ordering::Acquire) {
            return Err(FabricError::NotConnected);
        }
        let Some(peer) = self.shared.peer.lock().upgrade() else {
            return Err(FabricError::NotConnected);
        };
        let Some(armed) = peer.armed.pop() else {
            tracing::warn!(wr_id, "peer has no receive slot armed");
            self.complete_send(wr_id, CompletionStatus::ReceiverNotReady);
            return Ok(());
        };
        if payload.len() > armed.len {
            peer.recv_cq.push(RecvCompletion {
                slot: armed.slot,
                status: CompletionStatus::LocalFailure,
                byte_len: 0,
            });
            self.complete_send(wr_id, CompletionStatus::LocalFailure);
            return Ok(());
        }
        armed.buf.lock()[armed.offset..armed.offset + payload.len()].copy_from_slice(&payload);
        peer.recv_cq.push(RecvCompletion {
            slot: armed.slot,
            status: CompletionStatus::Success,
            byte_len: payload.len(),
        });
        self.complete_send(wr_id, CompletionStatus::Success);
        Ok(())
    }
}

impl Endpoint for LoopbackEndpoint {
    fn poll_connect(&self) -> Result<bool, FabricError> {
        if self.shared.established.load(Ordering::Acquire) {
            return Ok(true);
        }
        match self.target {
            Some(target) => {
                let listener = self
                    .hub
                    .listeners
                    .lock()
                    .get(&target)
                    .cloned()
                    .ok_or(FabricError::Refused(target))?;
                if !self.requested.swap(true, Ordering::AcqRel) {
                    let peer = LoopbackEndpoint::new(Arc::clone(&self.hub), self.attrs, None);
                    self.hub.record(FabricEvent::EndpointCreated { id: peer.id });
                    *peer.shared.peer.lock() = Arc::downgrade(&self.shared);
                    *self.shared.peer.lock() = Arc::downgrade(&peer.shared);
                    listener.pending.push(peer);
                }
                Ok(self.shared.established.load(Ordering::Acquire))
            }
            None => {
                // passive side: declaring ready releases the active side,
                // which is still spinning in its own poll_connect
                self.shared.established.store(true, Ordering::Release);
                if let Some(peer) = self.shared.peer.lock().upgrade() {
                    peer.established.store(true, Ordering::Release);
                }
                Ok(true)
            }
        }
    }

    fn register_region(&self, len: usize, remote_access: bool) -> Result<RegionHandle, FabricError> {
        {
            let mut faults = self.hub.faults.lock();
            if let Some(n) = faults.fail_registration_in.as_mut() {
                if *n <= 1 {
                    faults.fail_registration_in = None;
                    return Err(FabricError::Post("injected registration failure".into()));
                }
                *n -= 1;
            }
        }
        let mut regions = self.regions.lock();
        if regions.len() >= MAX_REGIONS {
            return Err(FabricError::RegionLimit(MAX_REGIONS));
        }
        let buf = Arc::new(Mutex::new(vec![0u8; len]));
        let base_addr = buf.lock().as_ptr() as u64;
        let lkey = self.hub.next_key.fetch_add(1, Ordering::Relaxed);
        let descriptor = if remote_access {
            let rkey = self.hub.next_key.fetch_add(1, Ordering::Relaxed);
            self.hub.exposed.insert(
                rkey,
                ExposedRegion {
                    base_addr,
                    buf: Arc::clone(&buf),
                },
            );
            Some(RegionDescriptor { base_addr, rkey })
        } else {
            None
        };
        regions.push((lkey, descriptor.map(|d| d.rkey)));
        self.hub.record(FabricEvent::RegionRegistered { lkey });
        Ok(RegionHandle::new(lkey, buf, descriptor))
    }

    fn deregister_region(&self, region: &RegionHandle) -> Result<(), FabricError> {
        let mut regions = self.regions.lock();
        let pos = regions
            .iter()
            .position(|(lkey, _)| *lkey == region.lkey())
            .ok_or_else(|| {
                FabricError::Post(format!(
                    "region lkey {} is not registered on this endpoint",
                    region.lkey()
                ))
            })?;
        let (lkey, rkey) = regions.remove(pos);
        if let Some(rkey) = rkey {
            self.hub.exposed.remove(&rkey);
        }
        self.hub.record(FabricEvent::RegionDeregistered { lkey });
        Ok(())
    }

    fn post_send(
        &self,
        wr_id: WrId,
        region: &RegionHandle,
        offset: usize,
        len: usize,
    ) -> Result<(), FabricError> {
        let payload = Bytes::from(region.read_at(offset, len)?);
        self.deliver(wr_id, payload)
    }

    fn post_send_inline(&self, wr_id: WrId, payload: &[u8]) -> Result<(), FabricError> {
        if payload.len() > self.attrs.max_inline {
            return Err(FabricError::InlineTooLarge {
                got: payload.len(),
                limit: self.attrs.max_inline,
            });
        }
        self.deliver(wr_id, Bytes::copy_from_slice(payload))
    }

    fn post_recv(
        &self,
        slot: SlotIndex,
        region: &RegionHandle,
        offset: usize,
        len: usize,
    ) -> Result<(), FabricError> {
        if self.shared.armed.len() >= self.attrs.queue_depth {
            return Err(FabricError::RecvQueueFull(self.attrs.queue_depth));
        }
        if offset
            .checked_add(len)
            .filter(|end| *end <= region.len())
            .is_none()
        {
            return Err(FabricError::OutOfBounds {
                offset,
                len,
                region: region.len(),
            });
        }
        self.shared.armed.push(ArmedRecv {
            slot,
            buf: region.shared_buf(),
            offset,
            len,
        });
        Ok(())
    }

    fn post_write(
        &self,
        wr_id: WrId,
        payload: &[u8],
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<(), FabricError> {
        if self.take_send_fault() {
            self.complete_send(wr_id, CompletionStatus::LocalFailure);
            return Ok(());
        }
        if !self.shared.established.load(Ordering::Acquire) {
            return Err(FabricError::NotConnected);
        }
        self.hub.record(FabricEvent::WriteIssued {
            remote_addr,
            rkey,
            len: payload.len(),
        });
        let status = self.hub.one_sided_write(remote_addr, rkey, payload);
        self.complete_send(wr_id, status);
        Ok(())
    }

    fn poll_send(&self) -> Option<SendCompletion> {
        self.shared.send_cq.pop()
    }

    fn poll_recv(&self) -> Option<RecvCompletion> {
        self.shared.recv_cq.pop()
    }

    fn disconnect(&self) {
        self.shared.established.store(false, Ordering::Release);
        let peer = std::mem::replace(&mut *self.shared.peer.lock(), Weak::new());
        if let Some(peer) = peer.upgrade() {
            peer.established.store(false, Ordering::Release);
            *peer.peer.lock() = Weak::new();
        }
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.disconnect();
        // exposures the owner never deregistered die with the endpoint
        for (_, rkey) in self.regions.lock().drain(..) {
            if let Some(rkey) = rkey {
                self.hub.exposed.remove(&rkey);
            }
        }
        self.hub.record(FabricEvent::EndpointDestroyed { id: self.id });
    }
}

/// Listener half of the loopback fabric. Unbinds its address on drop.
pub struct LoopbackListener {
    local: SocketAddr,
    shared: Arc<ListenerShared>,
    hub: Arc<Hub>,
}

impl Listener for LoopbackListener {
    fn try_accept(&self) -> Option<Box<dyn Endpoint>> {
        self.shared
            .pending
            .pop()
            .map(|ep| Box::new(ep) as Box<dyn Endpoint>)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.hub.listeners.lock().remove(&self.local);
    }
}

/// The in-process fabric instance. Endpoints and listeners created from the
/// same instance can reach each other; separate instances are isolated.
pub struct LoopbackFabric {
    hub: Arc<Hub>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub::new()),
        }
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<FabricEvent> {
        self.hub.events.lock().clone()
    }

    /// Complete the next posted send or one-sided write with a failure
    /// status instead of delivering it.
    pub fn fail_next_send(&self) {
        self.hub.faults.lock().fail_next_send = true;
    }

    /// Fail the `n`-th upcoming region registration (1-based).
    pub fn fail_nth_registration(&self, n: usize) {
        self.hub.faults.lock().fail_registration_in = Some(n);
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric for LoopbackFabric {
    fn create_endpoint(
        &self,
        target: SocketAddr,
        attrs: EndpointAttrs,
    ) -> Result<Box<dyn Endpoint>, FabricError> {
        if attrs.queue_depth == 0 {
            return Err(FabricError::InvalidAttrs(
                "queue depth must be at least 1".into(),
            ));
        }
        let ep = LoopbackEndpoint::new(Arc::clone(&self.hub), attrs, Some(target));
        self.hub.record(FabricEvent::EndpointCreated { id: ep.id });
        Ok(Box::new(ep))
    }

    fn bind(&self, local: SocketAddr) -> Result<Box<dyn Listener>, FabricError> {
        let mut listeners = self.hub.listeners.lock();
        if listeners.contains_key(&local) {
            return Err(FabricError::AddrInUse(local));
        }
        let shared = Arc::new(ListenerShared::default());
        listeners.insert(local, Arc::clone(&shared));
        tracing::debug!(addr = %local, "listener bound");
        Ok(Box::new(LoopbackListener {
            local,
            shared,
            hub: Arc::clone(&self.hub),
        }))
    }
}
