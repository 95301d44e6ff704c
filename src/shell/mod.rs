//! Shell pipeline executor.
//!
//! Composes child processes under `&&`/`||`/`|` with output redirection,
//! backgrounding and the `cd`/`exit` builtins. The front end that turns
//! text into a [`CommandLine`] is out of scope here; the model is built
//! programmatically and consumed exactly once by [`execute`].

mod command;
mod exec;

pub use self::command::{Cmd, CommandLine, Connector, OutputSink, Pipeline};
pub use self::exec::{Execution, execute};
