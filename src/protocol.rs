//! Wire types using rkyv for zero-copy serialization
//!
//! Manager calls, liveness messages and transport frames all derive
//! `Archive, Serialize, Deserialize`. Frames on a socket are a 4-byte little-endian
//! length followed by the archived bytes.

use crate::error::ChannelError;
use crate::intent::{ComponentName, Intent};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

/// Transaction code for every manager call; the request enum carries the method.
pub const MANAGER_CALL: u32 = 1;
/// Transaction code for liveness messages sent from host to client.
pub const MESSENGER_SEND: u32 = 1;

/// Frames above this size are treated as a protocol violation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Where a host should deliver its handshake.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct BroadcastAddress {
    /// Directory holding the receiver's socket
    pub dir: String,
    /// Broadcast action the receiver registered for
    pub action: String,
}

/// Calls on a privileged host's manager capability.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum ManagerRequest {
    /// Register the caller's liveness messenger (passed as the parcel's first binder)
    Connect,
    /// Bind a hosted service; the reply carries its capability, if any
    Bind { intent: Intent },
    /// Drop the caller's reference to a service
    Unbind { component: ComponentName },
    /// Force-stop a service. `uid` is only honoured for root callers.
    Stop {
        component: ComponentName,
        uid: i32,
        reply_to: Option<BroadcastAddress>,
    },
    /// Re-send the handshake to `uid` at `reply_to`
    Broadcast { uid: u32, reply_to: BroadcastAddress },
}

/// Reply to a [`ManagerRequest`].
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum ManagerReply {
    Ok,
    /// `bound` is false for a null binding
    Bound { bound: bool },
}

/// Messages from a host to a client's liveness messenger.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum MessengerMessage {
    /// A service the client referenced was torn down without its involvement
    ServiceStopped {
        component: ComponentName,
        daemon: bool,
    },
}

/// First frame a host sends on a fresh handshake connection.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct HandshakeHello {
    pub action: String,
    pub daemon: bool,
}

/// Capability reference inside a frame.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum WireBinder {
    /// An object exported by the sender of the frame
    Sender(u64),
    /// An object the receiver of the frame exported earlier
    Receiver(u64),
}

/// Outcome carried by a reply frame.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum WireStatus {
    Ok,
    DeadObject,
    Failed { message: String },
}

/// Everything that travels over a transport connection after the hello.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum WireMessage {
    Transact {
        id: u64,
        target: u64,
        code: u32,
        oneway: bool,
        data: Vec<u8>,
        binders: Vec<WireBinder>,
    },
    Reply {
        id: u64,
        status: WireStatus,
        data: Vec<u8>,
        binders: Vec<WireBinder>,
    },
    /// The receiver dropped every proxy for `handle` after getting it `count` times.
    Release { handle: u64, count: u64 },
}

macro_rules! wire_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                pub fn to_bytes(&self) -> Result<Vec<u8>, ChannelError> {
                    Ok(rkyv::to_bytes::<rkyv::rancor::Error>(self)?.into_vec())
                }

                pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChannelError> {
                    // Archived data must be aligned; socket buffers are not.
                    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
                    aligned.extend_from_slice(bytes);
                    Ok(rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)?)
                }
            }
        )*
    };
}

wire_codec!(
    ManagerRequest,
    ManagerReply,
    MessengerMessage,
    HandshakeHello,
    WireMessage,
);

/// Message frame for wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    /// Prefix already-encoded bytes with their length
    pub fn encode(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> Result<usize, ChannelError> {
        let len = u32::from_le_bytes(*buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::Protocol(format!("frame of {len} bytes exceeds limit")));
        }
        Ok(len)
    }
}
