pub mod channel;
pub mod client;
pub mod error;
pub mod fabric;
pub mod loopback;
pub mod memory;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::KvClient;
pub use error::{Error, Result};
pub use fabric::{CompletionStatus, Endpoint, EndpointAttrs, Fabric, FabricError, Listener};
pub use loopback::{FabricEvent, LoopbackFabric};
pub use protocol::{Message, MessageKind, RegionDescriptor, MESSAGE_SIZE, VALUE_SIZE};
pub use server::{DbServer, ServerConfig};
pub use session::{Session, SessionConfig, SessionState};
