//! Small Unix runtime primitives
//!
//! This crate collects five independent building blocks, each solving one
//! self-contained concurrency or I/O problem with a narrow, testable
//! contract:
//!
//! * [`corobus`]: an in-process multi-channel message bus scheduled by
//!   cooperative coroutines (plain futures on a single-threaded executor).
//! * [`shell`]: a pipeline executor composing child processes under
//!   `&&`/`||`/`|` with output redirection, backgrounding and the `cd`/`exit`
//!   builtins.
//! * [`userfs`]: an in-memory block filesystem with POSIX-like descriptor
//!   semantics.
//! * [`threadpool`]: a fixed-cap worker pool with lazy thread spawn and
//!   blocking or timed joins.
//! * [`chat`]: a line-oriented broadcast chat server and client over
//!   non-blocking TCP.
//!
//! The subsystems do not depend on each other; they only share the crate's
//! error-handling and logging conventions.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod chat;
pub mod corobus;
pub mod shell;
pub mod threadpool;
pub mod userfs;

pub use crate::chat::{ChatClient, ChatError, ChatEvents, ChatMessage, ChatServer};
pub use crate::corobus::{Bus, BusError, Handle};
pub use crate::shell::{Cmd, CommandLine, Connector, Execution, OutputSink, Pipeline, execute};
pub use crate::threadpool::{Pool, PoolError, ShutdownError, Task};
pub use crate::userfs::{Fd, FsError, OpenFlags, UserFs};
