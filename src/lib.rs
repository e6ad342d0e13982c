//! `burrow` relays SOCKS5 client traffic through an authenticated, encrypted,
//! multiplexed carrier connection between a local front-end and a remote
//! back-end. Many client sockets share one carrier; each client/target flow is
//! a logical channel identified by `(chann_id, magic)`.

pub mod config;
pub mod crypto;
pub mod dns;
pub mod local;
pub mod logging;
pub mod net;
pub mod proto;
pub mod remote;
pub mod time;

/// Per-channel transfer buffer size. Data frames never carry more payload
/// than one buffer's worth.
pub const CHANN_BUF_SIZE: usize = 65536;

/// Logical channel slots per carrier.
pub const CHANN_MAX_COUNT: usize = 1024;

/// Concurrent carriers accepted by the remote role.
pub const CLIENT_MAX_COUNT: usize = 6;
