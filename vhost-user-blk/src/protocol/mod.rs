//! Vhost-user control plane: wire opcodes, payload layouts, and the
//! per-connection framing that turns a control socket into a stream of
//! typed requests.

pub mod connection;
pub mod messages;

pub const GET_FEATURES: u32 = 1;
pub const SET_FEATURES: u32 = 2;
pub const SET_OWNER: u32 = 3;
pub const RESET_OWNER: u32 = 4;
pub const SET_MEM_TABLE: u32 = 5;
pub const SET_VRING_NUM: u32 = 8;
pub const SET_VRING_ADDR: u32 = 9;
pub const SET_VRING_BASE: u32 = 10;
pub const GET_VRING_BASE: u32 = 11;
pub const SET_VRING_KICK: u32 = 12;
pub const SET_VRING_CALL: u32 = 13;
pub const SET_VRING_ERR: u32 = 14;
pub const GET_PROTOCOL_FEATURES: u32 = 15;
pub const SET_PROTOCOL_FEATURES: u32 = 16;
pub const GET_QUEUE_NUM: u32 = 17;
pub const SET_VRING_ENABLE: u32 = 18;
pub const GET_CONFIG: u32 = 24;
pub const RESET_DEVICE: u32 = 34;

pub const VHOST_USER_F_PROTOCOL_FEATURES: u64 = 1 << 30;

pub const PROTOCOL_F_MQ: u64 = 1 << 0;
pub const PROTOCOL_F_REPLY_ACK: u64 = 1 << 3;
pub const PROTOCOL_F_CONFIG: u64 = 1 << 9;
pub const PROTOCOL_F_RESET_DEVICE: u64 = 1 << 13;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    ShortRead,
    UnknownRequest(u32),
    BadPayloadSize,
    DuplicateOwner,
    VringIndexOutOfRange(u8),
    FeatureNotOffered(u64),
    Io(#[from] std::io::Error),
    Memory(#[from] crate::memory::Error),
    Virtqueue(#[from] crate::virtqueue::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> std::io::Error {
        std::io::Error::other(e)
    }
}
