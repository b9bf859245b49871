pub mod commands;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod message;
pub mod server;
pub mod storage;
pub mod transport;

pub use error::Error;

use std::time::Duration;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const ID_SIZE: usize = 32;
pub const STREAM_BUF_SIZE: usize = 32 * 1024;
pub const MAX_MESSAGE_SIZE: usize = 1024;

pub const DEFAULT_ROOT: &str = "ggnetwork";

/// How long `get` waits for the first peer to start streaming a reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// How long an inbound handler waits for the bulk stream announced by a
/// control frame to arrive on the same connection.
pub const STREAM_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
