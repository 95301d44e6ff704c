//! Pipeline construction, short-circuit evaluation and reaping.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;

use log::warn;

use super::command::{Cmd, CommandLine, Connector, OutputSink, Pipeline};

/// Exit code reported for a command that could not be spawned.
const EXIT_CANNOT_EXEC: i32 = 127;

/// Result of executing one command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    /// Exit code of the last pipeline that ran.
    pub code: i32,
    /// Set when a top-level `exit` builtin asks the host process to
    /// terminate with the given code.
    pub exit: Option<i32>,
}

/// Execute a command line and report its exit code.
///
/// A background line is handed to a detached reaper thread and reports
/// code 0 immediately; its children never become the caller's problem.
pub fn execute(line: &CommandLine) -> io::Result<Execution> {
    if line.background {
        let mut line = line.clone();
        line.background = false;
        thread::Builder::new()
            .name("shell-background".into())
            .spawn(move || {
                if let Err(err) = run_line(&line) {
                    warn!("background command line failed: {err}");
                }
            })?;
        return Ok(Execution {
            code: 0,
            exit: None,
        });
    }
    run_line(line)
}

fn run_line(line: &CommandLine) -> io::Result<Execution> {
    let mut outcome = run_pipeline(&line.first, &line.sink, line.rest.is_empty())?;
    let mut index = 0;
    while index < line.rest.len() {
        let (connector, pipeline) = &line.rest[index];
        match connector {
            Connector::And => {
                if outcome.code != 0 {
                    break;
                }
            }
            Connector::Or => {
                if outcome.code == 0 {
                    // Skip forward through ||-chained pipelines until an
                    // && or the end of the line.
                    while index < line.rest.len() && line.rest[index].0 == Connector::Or {
                        index += 1;
                    }
                    continue;
                }
            }
        }
        outcome = run_pipeline(pipeline, &line.sink, index + 1 == line.rest.len())?;
        index += 1;
    }
    Ok(outcome)
}

fn run_pipeline(pipeline: &Pipeline, sink: &OutputSink, is_final: bool) -> io::Result<Execution> {
    let mut children: Vec<Child> = Vec::new();
    let mut prev_stdout: Option<ChildStdout> = None;
    let mut prev_failed = false;
    let mut code = 0;
    let mut exit_builtin = None;
    let mut exit_request = None;

    let last_external = pipeline
        .commands
        .iter()
        .rposition(|cmd| !is_builtin(&cmd.exe));
    let discard_output = exit_discards_output(&pipeline.commands);

    for (index, cmd) in pipeline.commands.iter().enumerate() {
        match cmd.exe.as_str() {
            "cd" => {
                code = run_cd(cmd);
                continue;
            }
            "exit" => {
                let requested = cmd.args.first().and_then(|arg| arg.parse().ok()).unwrap_or(0);
                exit_builtin = Some(requested);
                if is_final && pipeline.commands.len() == 1 {
                    exit_request = Some(requested);
                }
                continue;
            }
            _ => {}
        }

        let mut command = Command::new(&cmd.exe);
        command.args(&cmd.args);
        match prev_stdout.take() {
            Some(prev) => {
                command.stdin(Stdio::from(prev));
            }
            None if prev_failed => {
                command.stdin(Stdio::null());
            }
            None => {}
        }
        if Some(index) == last_external {
            let file = open_sink(sink)?;
            if discard_output {
                // The sink is still opened (and truncated) as usual; the
                // bytes go nowhere.
                drop(file);
                command.stdout(Stdio::null());
            } else if let Some(file) = file {
                command.stdout(Stdio::from(file));
            }
        } else {
            command.stdout(Stdio::piped());
        }

        match command.spawn() {
            Ok(mut child) => {
                // Moving the ChildStdout on is what closes the parent's
                // copies of the pipe ends; leaking one here would starve
                // the downstream command of its EOF.
                prev_stdout = child.stdout.take();
                prev_failed = false;
                children.push(child);
            }
            Err(err) => {
                warn!("cannot spawn {}: {err}", cmd.exe);
                prev_failed = true;
                code = EXIT_CANNOT_EXEC;
            }
        }
    }

    // Reap in spawn order; the last child decides the pipeline's code.
    let mut last_status = None;
    for mut child in children {
        last_status = Some(child.wait()?);
    }
    if !prev_failed {
        if let Some(status) = last_status {
            code = exit_status_code(status);
        }
    }
    // An `exit` anywhere in the pipeline spawns nothing, but its code
    // becomes the pipeline's result.
    if let Some(requested) = exit_builtin {
        code = requested;
    }

    Ok(Execution {
        code,
        exit: exit_request,
    })
}

fn is_builtin(exe: &str) -> bool {
    matches!(exe, "cd" | "exit")
}

/// An `exit` that follows a spawned command swallows the pipeline's
/// output. An `exit` ahead of every spawned command does not.
fn exit_discards_output(commands: &[Cmd]) -> bool {
    let mut spawned = false;
    for cmd in commands {
        if cmd.exe == "exit" && spawned {
            return true;
        }
        if !is_builtin(&cmd.exe) {
            spawned = true;
        }
    }
    false
}

fn run_cd(cmd: &Cmd) -> i32 {
    match cmd.args.first().map(Path::new) {
        Some(dir) => match std::env::set_current_dir(dir) {
            Ok(()) => 0,
            Err(err) => {
                warn!("cd: {}: {err}", dir.display());
                1
            }
        },
        None => 0,
    }
}

fn open_sink(sink: &OutputSink) -> io::Result<Option<File>> {
    let file = match sink {
        OutputSink::Stdout => return Ok(None),
        OutputSink::Truncate(path) => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?,
        OutputSink::Append(path) => OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .mode(0o644)
            .open(path)?,
    };
    Ok(Some(file))
}

fn exit_status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
