//! Transport session: endpoint establishment, session state, and the strict
//! reverse-of-acquisition teardown ordering.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::channel::MessageChannel;
use crate::error::{Error, Result};
use crate::fabric::{Endpoint, EndpointAttrs, Fabric};
use crate::memory::{RecvRing, RegionHandle, SendRegion};
use crate::protocol::{RegionDescriptor, MESSAGE_SIZE};

/// Default remote address of the store.
pub const DEFAULT_ADDR: &str = "192.168.101.4";

/// Default remote port of the store.
pub const DEFAULT_PORT: u16 = 21212;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Remote host address.
    pub addr: String,
    /// Remote port.
    pub port: u16,
    /// Symmetric send/receive queue capacity; also the receive slot count.
    pub queue_depth: usize,
    /// Transmit messages inline instead of registering a send region.
    pub inline_send: bool,
    /// Largest payload the endpoint accepts inline.
    pub max_inline: usize,
    /// Deadline applied to every completion wait. `None` waits forever,
    /// matching the base busy-wait behavior.
    pub poll_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            port: DEFAULT_PORT,
            queue_depth: 1,
            inline_send: false,
            max_inline: 64,
            poll_timeout: None,
        }
    }
}

/// Connection lifecycle of a session. A session that has not been built yet
/// is the implicit unconnected state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Connected; the remote database descriptor has not been exchanged yet.
    Connected,
    /// Descriptor exchanged; one-sided writes are permitted.
    Ready,
    /// Torn down.
    Terminated,
}

/// A live connection plus its queues and registered regions.
///
/// One session carries at most one in-flight operation: the dispatcher holds
/// it by `&mut`, so a new request cannot start while a response is
/// outstanding.
pub struct Session {
    channel: MessageChannel,
    state: SessionState,
    remote_db: Option<RegionDescriptor>,
}

impl Session {
    /// Resolve the remote endpoint, create the connection endpoint, register
    /// the message regions, arm every receive slot, and perform the
    /// handshake.
    ///
    /// Any failure tears down whatever was already acquired, most-recent
    /// first, before the error is returned.
    pub async fn connect(fabric: &dyn Fabric, config: &SessionConfig) -> Result<Self> {
        let target = resolve(&config.addr, config.port)?;
        let attrs = EndpointAttrs {
            queue_depth: config.queue_depth,
            max_inline: config.max_inline,
        };
        let endpoint = fabric
            .create_endpoint(target, attrs)
            .map_err(|e| Error::Connect(e.to_string()))?;

        let recv_region = match endpoint.register_region(config.queue_depth * MESSAGE_SIZE, false)
        {
            Ok(region) => region,
            Err(e) => {
                drop(endpoint);
                return Err(Error::Registration(format!("receive region: {e}")));
            }
        };

        let send_region = if config.inline_send {
            None
        } else {
            match endpoint.register_region(MESSAGE_SIZE, false) {
                Ok(region) => Some(region),
                Err(e) => {
                    release_partial(endpoint, &[&recv_region]);
                    return Err(Error::Registration(format!("send region: {e}")));
                }
            }
        };

        let recv_ring = RecvRing::new(recv_region, config.queue_depth);

        // arm every slot before the handshake so the first response cannot
        // outrun its buffer
        for slot in 0..recv_ring.slots() {
            if let Err(e) = endpoint.post_recv(
                slot,
                recv_ring.handle(),
                recv_ring.offset_of(slot),
                MESSAGE_SIZE,
            ) {
                let mut regions: Vec<&RegionHandle> = Vec::new();
                if let Some(region) = &send_region {
                    regions.push(region);
                }
                regions.push(recv_ring.handle());
                release_partial(endpoint, &regions);
                return Err(Error::Connect(format!(
                    "failed to arm receive slot {slot}: {e}"
                )));
            }
        }

        if let Err(e) = handshake(endpoint.as_ref(), config.poll_timeout).await {
            let mut regions: Vec<&RegionHandle> = Vec::new();
            if let Some(region) = &send_region {
                regions.push(region);
            }
            regions.push(recv_ring.handle());
            release_partial(endpoint, &regions);
            return Err(e);
        }

        tracing::debug!(addr = %config.addr, port = config.port, "session connected");

        let channel = MessageChannel::new(
            endpoint,
            send_region.map(SendRegion::new),
            recv_ring,
            config.poll_timeout,
        );
        Ok(Self {
            channel,
            state: SessionState::Connected,
            remote_db: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The remote database descriptor, once an info-exchange response has
    /// been observed.
    pub fn remote_db(&self) -> Option<RegionDescriptor> {
        self.remote_db
    }

    /// Store the descriptor from an info-exchange response. A repeated
    /// exchange overwrites the previous copy.
    pub(crate) fn set_remote_db(&mut self, descriptor: RegionDescriptor) {
        self.remote_db = Some(descriptor);
        if self.state == SessionState::Connected {
            self.state = SessionState::Ready;
        }
    }

    pub(crate) fn channel_mut(&mut self) -> &mut MessageChannel {
        &mut self.channel
    }

    /// Release queues, regions, and endpoint in reverse order of
    /// acquisition.
    pub fn shutdown(mut self) {
        self.state = SessionState::Terminated;
        let endpoint = self.channel.release();
        drop(endpoint);
        tracing::debug!("session terminated");
    }
}

/// Drive the connection handshake to completion.
async fn handshake(endpoint: &dyn Endpoint, poll_timeout: Option<Duration>) -> Result<()> {
    let deadline = poll_timeout.map(|t| (t, Instant::now() + t));
    loop {
        match endpoint.poll_connect() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => return Err(Error::Connect(e.to_string())),
        }
        if let Some((timeout, at)) = deadline {
            if Instant::now() >= at {
                return Err(Error::Connect(format!(
                    "handshake timed out after {timeout:?}"
                )));
            }
        }
        tokio::task::yield_now().await;
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

/// Resolve `addr:port` to the first matching socket address.
pub(crate) fn resolve(addr: &str, port: u16) -> Result<SocketAddr> {
    (addr, port)
        .to_socket_addrs()
        .map_err(|e| Error::Resolution {
            addr: addr.to_string(),
            port,
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| Error::Resolution {
            addr: addr.to_string(),
            port,
            reason: "no addresses returned".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal_address() {
        let addr = resolve("127.0.0.1", 21212).unwrap();
        assert_eq!(addr, "127.0.0.1:21212".parse().unwrap());
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.queue_depth, 1);
        assert!(!config.inline_send);
        assert!(config.poll_timeout.is_none());
    }
}
