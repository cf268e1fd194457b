//! Fabric seam: the verbs-like operations the engine is written against.
//!
//! [`crate::loopback`] provides the in-process backend; a hardware verbs
//! backend would implement the same traits. Post operations never block, and
//! completions are reaped through [`Endpoint::poll_send`] /
//! [`Endpoint::poll_recv`].

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

use crate::memory::RegionHandle;

/// Work request identifier, designated by the poster of a send-side
/// operation and echoed in its completion.
pub type WrId = u64;

/// Index of one fixed receive slot, echoed in its receive completion.
pub type SlotIndex = usize;

/// Local access key of a registered region.
pub type Lkey = u32;

/// Remote access key of a region exposed for one-sided writes.
pub type Rkey = u32;

/// Queue attributes for a new endpoint.
#[derive(Clone, Copy, Debug)]
pub struct EndpointAttrs {
    /// Symmetric send/receive queue capacity, in messages.
    pub queue_depth: usize,
    /// Largest payload the fabric accepts inline, without a registered send
    /// region.
    pub max_inline: usize,
}

impl Default for EndpointAttrs {
    fn default() -> Self {
        Self {
            queue_depth: 1,
            max_inline: 64,
        }
    }
}

/// Outcome reported by a completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// The fabric failed the operation locally.
    LocalFailure,
    /// The peer had no receive slot armed for an inbound send.
    ReceiverNotReady,
    /// A one-sided write was refused by key or bounds validation.
    RemoteAccess,
}

impl CompletionStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::LocalFailure => write!(f, "local failure"),
            Self::ReceiverNotReady => write!(f, "receiver not ready"),
            Self::RemoteAccess => write!(f, "remote access error"),
        }
    }
}

/// Completion of a send or one-sided write.
#[derive(Clone, Copy, Debug)]
pub struct SendCompletion {
    pub wr_id: WrId,
    pub status: CompletionStatus,
}

/// Completion of a receive. `slot` is the index the buffer was posted with;
/// the dispatcher uses it to locate the frame and to repost the buffer.
#[derive(Clone, Copy, Debug)]
pub struct RecvCompletion {
    pub slot: SlotIndex,
    pub status: CompletionStatus,
    pub byte_len: usize,
}

/// Errors reported by fabric backends. The engine maps these into its own
/// taxonomy at each call site.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("endpoint is not connected")]
    NotConnected,
    #[error("no listener at {0}")]
    Refused(SocketAddr),
    #[error("address {0} is already bound")]
    AddrInUse(SocketAddr),
    #[error("invalid endpoint attributes: {0}")]
    InvalidAttrs(String),
    #[error("endpoint region limit reached ({0} regions)")]
    RegionLimit(usize),
    #[error("receive queue is full ({0} slots)")]
    RecvQueueFull(usize),
    #[error("inline payload of {got} bytes exceeds the {limit}-byte inline limit")]
    InlineTooLarge { got: usize, limit: usize },
    #[error("access of {len} bytes at offset {offset} exceeds region of {region} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region: usize,
    },
    #[error("post failed: {0}")]
    Post(String),
}

/// A fabric instance: creates endpoints and listeners.
pub trait Fabric: Send + Sync {
    /// Create an endpoint directed at `target` with the given queue
    /// attributes. The endpoint is not connected until
    /// [`Endpoint::poll_connect`] reports so.
    fn create_endpoint(
        &self,
        target: SocketAddr,
        attrs: EndpointAttrs,
    ) -> Result<Box<dyn Endpoint>, FabricError>;

    /// Bind a listener at `local`.
    fn bind(&self, local: SocketAddr) -> Result<Box<dyn Listener>, FabricError>;
}

/// Accepts inbound connections.
pub trait Listener: Send + Sync {
    /// Pop one pending connection, if any. Non-blocking.
    ///
    /// The returned endpoint is not yet established: the acceptor should
    /// register its regions and arm its receive slots, then drive
    /// [`Endpoint::poll_connect`], so the peer's first send cannot arrive
    /// before a buffer is ready for it.
    fn try_accept(&self) -> Option<Box<dyn Endpoint>>;

    /// The bound address.
    fn local_addr(&self) -> SocketAddr;
}

/// One connection on the fabric: paired send/receive queues plus region
/// registration.
pub trait Endpoint: Send + Sync {
    /// Drive this side of the connection handshake. Returns `true` once the
    /// connection is established; callers retry until then.
    fn poll_connect(&self) -> Result<bool, FabricError>;

    /// Register a `len`-byte region. Either the whole buffer is covered or
    /// registration fails. Remote-accessible regions also carry a
    /// [`crate::protocol::RegionDescriptor`] granting the peer one-sided
    /// write access.
    fn register_region(&self, len: usize, remote_access: bool) -> Result<RegionHandle, FabricError>;

    /// Deregister a region; the only region teardown operation. Must happen
    /// before the owning endpoint is destroyed.
    fn deregister_region(&self, region: &RegionHandle) -> Result<(), FabricError>;

    /// Post a send of `region[offset..offset + len]`, tagged `wr_id`.
    fn post_send(
        &self,
        wr_id: WrId,
        region: &RegionHandle,
        offset: usize,
        len: usize,
    ) -> Result<(), FabricError>;

    /// Post a send of `payload` without a registered region.
    fn post_send_inline(&self, wr_id: WrId, payload: &[u8]) -> Result<(), FabricError>;

    /// Arm receive slot `slot`, backed by `region[offset..offset + len]`.
    fn post_recv(
        &self,
        slot: SlotIndex,
        region: &RegionHandle,
        offset: usize,
        len: usize,
    ) -> Result<(), FabricError>;

    /// Post a one-sided write of `payload` into remote memory at
    /// `remote_addr`, authorized by `rkey`. Its completion arrives on the
    /// send queue; no remote logic is invoked.
    fn post_write(
        &self,
        wr_id: WrId,
        payload: &[u8],
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<(), FabricError>;

    /// Reap one send-queue completion, if any. Non-blocking.
    fn poll_send(&self) -> Option<SendCompletion>;

    /// Reap one receive-queue completion, if any. Non-blocking.
    fn poll_recv(&self) -> Option<RecvCompletion>;

    /// Tear the connection down. Safe to call on an unconnected endpoint.
    fn disconnect(&self);
}
