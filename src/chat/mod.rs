//! Line-oriented broadcast chat over non-blocking TCP.
//!
//! Wire protocol: the first `\n`-terminated line a client sends after
//! connecting is its name; every later line is a chat message. The server
//! rebroadcasts each message to every other peer as `author:payload\n`.
//! Messages fed by the server's owner go out under the author `server` and
//! are replayed to peers that join later; peer chat is not replayed.
//!
//! Both endpoints are single-threaded reactors: all I/O happens inside
//! `update(timeout)`, which waits for readiness and then drains every ready
//! socket until it would block. IPv4 only.

mod client;
mod message;
mod server;

pub use self::client::ChatClient;
pub use self::message::ChatMessage;
pub use self::server::ChatServer;

use std::io;
use std::time::Duration;

use bitflags::bitflags;
use nix::poll::{PollFlags, PollTimeout};
use thiserror::Error;

/// Errors reported by chat endpoints.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A parameter is malformed, e.g. an address without a `host:port`
    /// shape.
    #[error("invalid argument")]
    InvalidArgument,
    /// The readiness wait elapsed with no I/O.
    #[error("timed out waiting for I/O")]
    Timeout,
    /// The listening port is taken.
    #[error("port is busy")]
    PortBusy,
    /// The host did not resolve to an IPv4 endpoint.
    #[error("no usable address")]
    NoAddr,
    /// The endpoint is already listening or connected.
    #[error("already started")]
    AlreadyStarted,
    /// The endpoint was never started, or its connection is gone.
    #[error("not started")]
    NotStarted,
    /// Unrecoverable OS error.
    #[error("system error: {0}")]
    Sys(#[from] io::Error),
}

bitflags! {
    /// Readiness interest of an endpoint, for embedding it into an
    /// external event loop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChatEvents: u8 {
        /// The endpoint wants to read.
        const INPUT = 1;
        /// The endpoint has queued output to flush.
        const OUTPUT = 2;
    }
}

impl ChatEvents {
    /// The equivalent `poll(2)` event mask.
    pub fn to_poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.contains(ChatEvents::INPUT) {
            flags |= PollFlags::POLLIN;
        }
        if self.contains(ChatEvents::OUTPUT) {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

fn sys(err: nix::errno::Errno) -> ChatError {
    ChatError::Sys(io::Error::from_raw_os_error(err as i32))
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    u16::try_from(timeout.as_millis())
        .map(PollTimeout::from)
        .unwrap_or(PollTimeout::MAX)
}
