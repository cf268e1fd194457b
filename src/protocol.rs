//! Wire protocol for the kvdirect engine.
//!
//! A single fixed-layout message shape is used in both directions. Both peers
//! register identically sized buffers, so the encoded size must never vary;
//! bincode's fixint little-endian encoding keeps it constant and a test pins
//! the value.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Encoded size of a [`Message`] in bytes: 4 (kind tag) + 4 (key) +
/// 4 (value) + 12 (descriptor).
pub const MESSAGE_SIZE: usize = 24;

/// Byte stride of one value slot in the remote database.
pub const VALUE_SIZE: usize = std::mem::size_of::<i32>();

/// Operation tag of a [`Message`]. Tag order is part of the wire contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Query,
    QueryResp,
    Set,
    SetResp,
    Disconnect,
    ExchangeDbInfo,
}

/// Descriptor for a memory region its owner exposes for one-sided writes.
///
/// Supplied by the remote peer via an info-exchange response. The client owns
/// a single copy, overwritten by any later info-exchange response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    /// Base address of the region in the owner's address space.
    pub base_addr: u64,
    /// Remote access key authorizing writes into the region.
    pub rkey: u32,
}

/// The message exchanged over the channel.
///
/// Fields other than `kind` are don't-care for kinds that do not use them;
/// unused fields are zeroed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub key: i32,
    pub value: i32,
    /// Meaningful only for `ExchangeDbInfo` responses.
    pub db_info: RegionDescriptor,
}

impl Message {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            key: 0,
            value: 0,
            db_info: RegionDescriptor::default(),
        }
    }

    pub fn query(key: i32) -> Self {
        Self {
            key,
            ..Self::new(MessageKind::Query)
        }
    }

    pub fn query_resp(key: i32, value: i32) -> Self {
        Self {
            key,
            value,
            ..Self::new(MessageKind::QueryResp)
        }
    }

    pub fn set(key: i32, value: i32) -> Self {
        Self {
            key,
            value,
            ..Self::new(MessageKind::Set)
        }
    }

    pub fn set_resp(key: i32, value: i32) -> Self {
        Self {
            key,
            value,
            ..Self::new(MessageKind::SetResp)
        }
    }

    pub fn disconnect() -> Self {
        Self::new(MessageKind::Disconnect)
    }

    pub fn exchange_db_info() -> Self {
        Self::new(MessageKind::ExchangeDbInfo)
    }

    pub fn db_info_resp(db_info: RegionDescriptor) -> Self {
        Self {
            db_info,
            ..Self::new(MessageKind::ExchangeDbInfo)
        }
    }

    /// Encode into a fixed-size wire frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Send(format!("message encode failed: {e}")))
    }

    /// Decode a wire frame. An unknown kind tag fails here, which the
    /// dispatcher treats as a protocol violation.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        bincode::deserialize(frame).map_err(|e| Error::Rpc(format!("undecodable frame: {e}")))
    }
}
