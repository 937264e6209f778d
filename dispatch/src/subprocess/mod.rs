// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Child-process launcher with structured failure reporting. See [`Subprocess`].

// Attach.
pub mod command_line;

// Re-export.
pub use command_line::{CommandLineError, parse_command_arguments};

use bitflags::bitflags;
use rustix::{io::Errno,
             process::{Pid, WaitOptions, WaitStatus, waitpid}};
use std::{ffi::OsStr,
          fmt, io,
          process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio}};

bitflags! {
    /// Which of the child's standard streams are connected to parent-side pipes.
    ///
    /// Streams not requested are redirected to `/dev/null` in the child, except
    /// stderr when [`KEEP_STDERR`](Self::KEEP_STDERR) is set, which leaves it
    /// connected to the parent's stderr (useful for surfacing diagnostics of
    /// helper tools).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleSpec: u8 {
        /// Pipe the child's stdin; the parent gets the write end.
        const STDIN = 0x1;
        /// Pipe the child's stdout; the parent gets the read end.
        const STDOUT = 0x2;
        /// Pipe the child's stderr; the parent gets the read end.
        const STDERR = 0x4;
        /// Inherit the parent's stderr instead of `/dev/null`. Ignored when
        /// [`STDERR`](Self::STDERR) is set.
        const KEEP_STDERR = 0x80;
    }
}

/// The launch step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnPhase {
    /// Creating or wiring the stdio pipes failed (descriptor exhaustion).
    PipeSetup,
    /// Creating the child process failed (process/memory limits).
    Fork,
    /// The child was created but could not execute the binary.
    Exec,
}

/// Structured launch-failure record: which phase failed and the OS error.
///
/// Returned, never panicked: launch failure is an expected outcome (missing
/// binaries, permission problems), and the caller decides whether it is fatal.
/// The underlying mechanism is the close-on-exec status pipe: the child reports
/// a pre-exec errno through a pipe that a successful exec closes unwritten, so
/// end-of-file means the program is running.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("subprocess launch failed in the {phase:?} phase")]
#[diagnostic(code(biodispatch::subprocess::spawn))]
pub struct SpawnFailure {
    pub phase: SpawnPhase,
    #[source]
    pub source: io::Error,
}

impl SpawnFailure {
    /// The raw `errno` reported by the OS, when there is one.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> { self.source.raw_os_error() }
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Normal exit; `code` is the exit status.
    Exited,
    /// Killed by a signal; `code` is the signal number.
    Signalled,
    /// Stopped by a signal; `code` is the signal number.
    Stopped,
    Unknown,
}

/// Result of [`Subprocess::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    pub kind: CloseKind,
    pub code: i32,
    pub pid: u32,
}

impl CloseOutcome {
    fn from_wait_status(status: WaitStatus, pid: u32) -> Self {
        let (kind, code) = if let Some(code) = status.exit_status() {
            (CloseKind::Exited, code as i32)
        } else if let Some(signal) = status.terminating_signal() {
            (CloseKind::Signalled, signal as i32)
        } else if let Some(signal) = status.stopping_signal() {
            (CloseKind::Stopped, signal as i32)
        } else {
            (CloseKind::Unknown, 0)
        };
        Self { kind, code, pid }
    }
}

/// A running child process plus the parent-side ends of its requested pipes.
///
/// ```no_run
/// use biodispatch::{HandleSpec, Subprocess};
/// use std::io::Read;
///
/// let mut child = Subprocess::open(&["echo", "hi"], HandleSpec::STDOUT)?;
/// let mut output = String::new();
/// child
///     .stdout_handle()
///     .expect("stdout was requested")
///     .read_to_string(&mut output)?;
/// let outcome = child.close()?;
/// # let _ = (output, outcome);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// The pipe handles expose raw descriptors, so readiness can be watched with
/// the event manager. [`close()`](Self::close) drops the parent-side pipe ends
/// (a child blocked reading stdin sees end-of-file), waits for the child, and
/// classifies how it terminated. The wait uses the untraced option, so a child
/// stopped by a signal is observed as [`CloseKind::Stopped`] rather than
/// blocking the caller until it exits. Dropping an unclosed `Subprocess` does
/// the same, discarding the outcome.
pub struct Subprocess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    reaped: bool,
}

impl Subprocess {
    /// Launches `argv[0]` with arguments `argv[1..]` and the stdio wiring
    /// requested by `spec`. No shell is involved; see
    /// [`parse_command_arguments`] to split a command line first.
    ///
    /// # Errors
    ///
    /// A [`SpawnFailure`] with the failing phase and OS error. A missing binary
    /// surfaces as phase [`Exec`](SpawnPhase::Exec) with `ENOENT`.
    pub fn open<S: AsRef<OsStr>>(
        argv: &[S],
        spec: HandleSpec,
    ) -> Result<Self, SpawnFailure> {
        let Some((program, args)) = argv.split_first() else {
            return Err(SpawnFailure {
                phase: SpawnPhase::Exec,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "empty argument vector",
                ),
            });
        };

        let mut command = Command::new(program);
        command.args(args);
        command.stdin(if spec.contains(HandleSpec::STDIN) {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(if spec.contains(HandleSpec::STDOUT) {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stderr(if spec.contains(HandleSpec::STDERR) {
            Stdio::piped()
        } else if spec.contains(HandleSpec::KEEP_STDERR) {
            Stdio::inherit()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(classify_spawn_error)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            reaped: false,
        })
    }

    /// Splits `command_line` on unquoted whitespace and launches the result.
    ///
    /// # Errors
    ///
    /// Malformed quoting surfaces as a [`SpawnFailure`] in the
    /// [`Exec`](SpawnPhase::Exec) phase with an `InvalidInput` error; launch
    /// failures as in [`open()`](Self::open).
    pub fn parse_and_open(
        command_line: &str,
        spec: HandleSpec,
    ) -> Result<Self, SpawnFailure> {
        let argv = parse_command_arguments(command_line).map_err(|error| {
            SpawnFailure {
                phase: SpawnPhase::Exec,
                source: io::Error::new(io::ErrorKind::InvalidInput, error),
            }
        })?;
        Self::open(&argv, spec)
    }

    #[must_use]
    pub fn pid(&self) -> u32 { self.child.id() }

    /// Write end of the child's stdin, when [`HandleSpec::STDIN`] was requested
    /// and the handle has not been taken. Drop (or [`take_stdin`]) to deliver
    /// end-of-file.
    ///
    /// [`take_stdin`]: Self::take_stdin
    pub fn stdin_handle(&mut self) -> Option<&mut ChildStdin> { self.stdin.as_mut() }

    /// Read end of the child's stdout, when [`HandleSpec::STDOUT`] was
    /// requested and the handle has not been taken.
    pub fn stdout_handle(&mut self) -> Option<&mut ChildStdout> {
        self.stdout.as_mut()
    }

    /// Read end of the child's stderr, when [`HandleSpec::STDERR`] was
    /// requested and the handle has not been taken.
    pub fn stderr_handle(&mut self) -> Option<&mut ChildStderr> {
        self.stderr.as_mut()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> { self.stdin.take() }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> { self.stdout.take() }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> { self.stderr.take() }

    /// Closes the parent-side pipe ends, waits for the child and reports how it
    /// terminated.
    ///
    /// The wait requests untraced children, so a child stopped by a signal
    /// yields [`CloseKind::Stopped`] with the stopping signal as the code. A
    /// stopped child is still alive afterwards; its fate belongs to the caller.
    ///
    /// # Errors
    ///
    /// The underlying wait failing, which leaves the child's fate unknown.
    pub fn close(mut self) -> io::Result<CloseOutcome> {
        // Pipes first: a child blocked reading stdin must see end-of-file, or
        // the wait below would deadlock.
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();

        let outcome = self.wait_for_outcome();
        self.reaped = true;
        outcome
    }

    /// Waits for the child to exit, be killed, or stop.
    ///
    /// `std::process::Child::wait` never passes the untraced option, so it
    /// would block on a stopped child forever; wait through `rustix` instead.
    /// Interrupted waits are retried; a child some other actor already reaped
    /// is optimistically reported as a clean exit.
    fn wait_for_outcome(&self) -> io::Result<CloseOutcome> {
        let pid = self.child.id();
        let wait_pid = Pid::from_child(&self.child);
        loop {
            match waitpid(Some(wait_pid), WaitOptions::UNTRACED) {
                Ok(Some((_, status))) => {
                    return Ok(CloseOutcome::from_wait_status(status, pid));
                }
                Ok(None) => {
                    return Ok(CloseOutcome {
                        kind: CloseKind::Unknown,
                        code: 0,
                        pid,
                    });
                }
                Err(errno) if errno == Errno::INTR => {}
                Err(errno) if errno == Errno::CHILD => {
                    return Ok(CloseOutcome {
                        kind: CloseKind::Exited,
                        code: 0,
                        pid,
                    });
                }
                Err(errno) => return Err(errno.into()),
            }
        }
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();
        if let Err(error) = self.wait_for_outcome() {
            tracing::error!(%error, pid = self.child.id(), "failed to reap subprocess");
        }
    }
}

impl fmt::Debug for Subprocess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subprocess")
            .field("pid", &self.child.id())
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Attributes a `spawn()` error to the launch phase it belongs to.
///
/// `std::process` performs pipe creation, process creation and exec inside one
/// call, reporting a single `io::Error`; the errno tells the phases apart. The
/// exec set mirrors the errors `execvp` documents for a bad binary or path.
fn classify_spawn_error(error: io::Error) -> SpawnFailure {
    const EXEC_ERRNOS: &[Errno] = &[
        Errno::NOENT,
        Errno::ACCESS,
        Errno::LOOP,
        Errno::NAMETOOLONG,
        Errno::NOTDIR,
        Errno::TOOBIG,
        Errno::NOEXEC,
        Errno::TXTBSY,
        Errno::FAULT,
        Errno::IO,
        Errno::ISDIR,
    ];
    const FORK_ERRNOS: &[Errno] = &[Errno::AGAIN, Errno::NOMEM, Errno::NOSYS];
    const PIPE_ERRNOS: &[Errno] = &[Errno::MFILE, Errno::NFILE];

    let phase = match error.raw_os_error() {
        Some(errno) if PIPE_ERRNOS.iter().any(|e| e.raw_os_error() == errno) => {
            SpawnPhase::PipeSetup
        }
        Some(errno) if FORK_ERRNOS.iter().any(|e| e.raw_os_error() == errno) => {
            SpawnPhase::Fork
        }
        Some(errno) if EXEC_ERRNOS.iter().any(|e| e.raw_os_error() == errno) => {
            SpawnPhase::Exec
        }
        // Exec failures dominate in practice; attribute unknown errnos there.
        _ => SpawnPhase::Exec,
    };
    SpawnFailure {
        phase,
        source: error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::{Read, Write};

    #[test]
    fn echo_output_is_captured_and_exit_is_clean() {
        let mut child =
            Subprocess::open(&["echo", "hi"], HandleSpec::STDOUT).expect("spawn echo");

        let mut output = String::new();
        child
            .stdout_handle()
            .expect("stdout was requested")
            .read_to_string(&mut output)
            .expect("read stdout");
        assert_eq!(output, "hi\n");

        let outcome = child.close().expect("close");
        assert_eq!(outcome.kind, CloseKind::Exited);
        assert_eq!(outcome.code, 0);
    }

    #[test]
    fn missing_binary_reports_exec_phase_and_enoent() {
        let failure =
            Subprocess::open(&["/definitely/not/a/binary"], HandleSpec::empty())
                .expect_err("binary does not exist");

        assert_eq!(failure.phase, SpawnPhase::Exec);
        assert_eq!(failure.raw_os_error(), Some(Errno::NOENT.raw_os_error()));
    }

    #[test]
    fn nonzero_exit_code_is_reported() {
        let child = Subprocess::open(&["sh", "-c", "exit 3"], HandleSpec::empty())
            .expect("spawn sh");
        let outcome = child.close().expect("close");
        assert_eq!(outcome.kind, CloseKind::Exited);
        assert_eq!(outcome.code, 3);
    }

    #[test]
    fn child_killed_by_signal_is_classified_as_signalled() {
        let child = Subprocess::open(&["sh", "-c", "kill -9 $$"], HandleSpec::empty())
            .expect("spawn sh");
        let outcome = child.close().expect("close");
        assert_eq!(outcome.kind, CloseKind::Signalled);
        assert_eq!(outcome.code, 9);
    }

    #[test]
    fn stopped_child_is_classified_as_stopped() {
        let child =
            Subprocess::open(&["sh", "-c", "kill -STOP $$"], HandleSpec::empty())
                .expect("spawn sh");
        let pid = child.pid();

        // The untraced wait observes the stop instead of blocking until exit.
        let outcome = child.close().expect("close");
        assert_eq!(outcome.kind, CloseKind::Stopped);
        assert_eq!(outcome.code, signal_hook::consts::SIGSTOP);
        assert_eq!(outcome.pid, pid);

        // The stopped child is still alive; kill and reap it so the test
        // leaves nothing behind.
        let kill_command = format!("kill -9 {pid}");
        Subprocess::open(&["sh", "-c", kill_command.as_str()], HandleSpec::empty())
            .expect("spawn killer")
            .close()
            .expect("close killer");
        let wait_pid = Pid::from_raw(pid as i32).expect("valid pid");
        waitpid(Some(wait_pid), WaitOptions::empty()).expect("reap stopped child");
    }

    #[test]
    fn stdin_pipe_round_trips_through_cat() {
        let mut child =
            Subprocess::open(&["cat"], HandleSpec::STDIN | HandleSpec::STDOUT)
                .expect("spawn cat");

        child
            .stdin_handle()
            .expect("stdin was requested")
            .write_all(b"hello")
            .expect("write to child");
        // Deliver end-of-file so cat terminates.
        drop(child.take_stdin());

        let mut output = String::new();
        child
            .stdout_handle()
            .expect("stdout was requested")
            .read_to_string(&mut output)
            .expect("read stdout");
        assert_eq!(output, "hello");

        let outcome = child.close().expect("close");
        assert_eq!(outcome.kind, CloseKind::Exited);
        assert_eq!(outcome.code, 0);
    }

    #[test]
    fn unrequested_streams_have_no_handles() {
        let mut child =
            Subprocess::open(&["echo", "hi"], HandleSpec::empty()).expect("spawn echo");
        assert!(child.stdin_handle().is_none());
        assert!(child.stdout_handle().is_none());
        assert!(child.stderr_handle().is_none());

        // The child's stdout went to /dev/null; it still exits cleanly.
        let outcome = child.close().expect("close");
        assert_eq!(outcome.code, 0);
    }

    #[test]
    fn empty_argv_is_rejected() {
        let failure = Subprocess::open::<&str>(&[], HandleSpec::empty())
            .expect_err("nothing to execute");
        assert_eq!(failure.phase, SpawnPhase::Exec);
        assert_eq!(failure.source.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn parse_and_open_runs_a_quoted_command_line() {
        let mut child = Subprocess::parse_and_open("echo 'one two'", HandleSpec::STDOUT)
            .expect("spawn echo");
        let mut output = String::new();
        child
            .stdout_handle()
            .expect("stdout was requested")
            .read_to_string(&mut output)
            .expect("read stdout");
        assert_eq!(output, "one two\n");
        child.close().expect("close");
    }
}
