//! Isolated execution of the target command.
//!
//! `chroot(2)` and `unshare(CLONE_NEWPID)` cannot be undone, so they run in
//! a forked helper process. The helper walks the [`Isolation`] state
//! machine, spawns the command as the first process of the new PID
//! namespace, waits for it, and sends a [`HelperReport`] back over a
//! close-on-exec pipe. The original process never leaves the host root and
//! stays free to delete the root directory afterwards.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use burrow_common::error::{BurrowError, Result};
use burrow_common::types::Termination;
use serde::{Deserialize, Serialize};

/// Position of a process in the isolation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationState {
    /// Still sees the host root.
    Unisolated,
    /// Root switched to the assembled filesystem.
    RootChanged,
    /// Future children land in a fresh PID namespace.
    NamespaceIsolated,
    /// The command ran (or could not be started).
    Terminated,
}

impl fmt::Display for IsolationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unisolated => "unisolated",
            Self::RootChanged => "root-changed",
            Self::NamespaceIsolated => "namespace-isolated",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// The isolation protocol for the calling process.
///
/// Transitions must happen in order: [`Isolation::change_root`], then
/// [`Isolation::isolate_pid_namespace`], then [`Isolation::launch`]. A call
/// out of order is rejected without touching the process. Nothing is
/// retried.
#[derive(Debug)]
pub struct Isolation {
    root: PathBuf,
    state: IsolationState,
}

impl Isolation {
    /// Starts the protocol for `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: IsolationState::Unisolated,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> IsolationState {
        self.state
    }

    /// `Unisolated` → `RootChanged`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Isolation`] if called out of order or if
    /// `chroot(2)` is rejected.
    pub fn change_root(&mut self) -> Result<()> {
        self.expect_state(IsolationState::Unisolated, "chroot")?;
        burrow_core::filesystem::chroot::change_root(&self.root)?;
        self.state = IsolationState::RootChanged;
        Ok(())
    }

    /// `RootChanged` → `NamespaceIsolated`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Isolation`] if called out of order or if the
    /// unshare is rejected.
    pub fn isolate_pid_namespace(&mut self) -> Result<()> {
        self.expect_state(IsolationState::RootChanged, "unshare")?;
        burrow_core::namespace::pid::unshare_pid_namespace()?;
        self.state = IsolationState::NamespaceIsolated;
        Ok(())
    }

    /// `NamespaceIsolated` → `Terminated`: runs `command` with `args` and
    /// waits for it.
    ///
    /// stdout and stderr are inherited; stdin reads from the root's
    /// `/dev/null`. The state is `Terminated` afterwards whether or not the
    /// command could be started.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Isolation`] if called out of order or if
    /// waiting fails, and [`BurrowError::Launch`] if the command cannot be
    /// started.
    pub fn launch(&mut self, command: &str, args: &[String]) -> Result<Termination> {
        self.expect_state(IsolationState::NamespaceIsolated, "exec")?;
        self.state = IsolationState::Terminated;

        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| launch_err(command, &e))?;

        // The command keeps the default disposition; only this process
        // ignores an interactive interrupt so it can still report.
        ignore_interrupts();

        let status = child.wait().map_err(|e| BurrowError::Isolation {
            stage: "wait",
            message: format!("waiting for {command} failed: {e}"),
        })?;
        termination_of(command, status)
    }

    fn expect_state(&self, required: IsolationState, stage: &'static str) -> Result<()> {
        if self.state == required {
            Ok(())
        } else {
            Err(BurrowError::Isolation {
                stage,
                message: format!("{stage} requires state {required}, process is {}", self.state),
            })
        }
    }
}

/// Outcome the helper sends back to the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HelperReport {
    /// The command exited with `code`.
    Exited {
        /// Exit status.
        code: i32,
    },
    /// The command was killed by `signal`.
    Signaled {
        /// Signal number.
        signal: i32,
    },
    /// The command could not be started.
    LaunchFailed {
        /// Command path inside the root.
        command: String,
        /// Description of the failure.
        message: String,
        /// Whether the command was missing.
        not_found: bool,
    },
    /// An isolation step was rejected.
    IsolationFailed {
        /// Stage that failed.
        stage: String,
        /// Description of the failure.
        message: String,
    },
}

impl HelperReport {
    /// Walks the whole protocol for `root` and summarizes the result.
    #[must_use]
    pub fn run(root: &Path, command: &str, args: &[String]) -> Self {
        let mut isolation = Isolation::new(root);
        let outcome = isolation
            .change_root()
            .and_then(|()| isolation.isolate_pid_namespace())
            .and_then(|()| isolation.launch(command, args));
        Self::from_outcome(outcome)
    }

    fn from_outcome(outcome: Result<Termination>) -> Self {
        match outcome {
            Ok(Termination::Exited(code)) => Self::Exited { code },
            Ok(Termination::Signaled(signal)) => Self::Signaled { signal },
            Err(BurrowError::Launch {
                command,
                message,
                not_found,
            }) => Self::LaunchFailed {
                command,
                message,
                not_found,
            },
            Err(BurrowError::Isolation { stage, message }) => Self::IsolationFailed {
                stage: stage.to_string(),
                message,
            },
            Err(other) => Self::IsolationFailed {
                stage: "helper".into(),
                message: other.to_string(),
            },
        }
    }

    /// Converts the report into the parent's result.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Launch`] or [`BurrowError::Isolation`] for the
    /// corresponding failure reports.
    pub fn into_result(self) -> Result<Termination> {
        match self {
            Self::Exited { code } => Ok(Termination::Exited(code)),
            Self::Signaled { signal } => Ok(Termination::Signaled(signal)),
            Self::LaunchFailed {
                command,
                message,
                not_found,
            } => Err(BurrowError::Launch {
                command,
                message,
                not_found,
            }),
            Self::IsolationFailed { stage, message } => Err(BurrowError::Isolation {
                stage: known_stage(&stage),
                message,
            }),
        }
    }
}

fn known_stage(stage: &str) -> &'static str {
    match stage {
        "chroot" => "chroot",
        "unshare" => "unshare",
        "exec" => "exec",
        "wait" => "wait",
        _ => "helper",
    }
}

fn launch_err(command: &str, e: &io::Error) -> BurrowError {
    BurrowError::Launch {
        command: command.to_string(),
        message: e.to_string(),
        not_found: e.kind() == io::ErrorKind::NotFound,
    }
}

fn termination_of(command: &str, status: ExitStatus) -> Result<Termination> {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => Ok(Termination::Exited(code)),
        (None, Some(signal)) => Ok(Termination::Signaled(signal)),
        (None, None) => Err(BurrowError::Isolation {
            stage: "wait",
            message: format!("{command} ended with an unrecognised status: {status}"),
        }),
    }
}

#[cfg(target_os = "linux")]
fn ignore_interrupts() {
    use nix::sys::signal::{SigHandler, Signal, signal};

    // SAFETY: installs SIG_IGN, which runs no code in signal context.
    if let Err(e) = unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) } {
        tracing::debug!(error = %e, "could not ignore SIGINT in helper");
    }
}

#[cfg(not(target_os = "linux"))]
const fn ignore_interrupts() {}

/// Runs `command` isolated inside `root` and reports how it terminated.
///
/// Forks a helper that performs the isolation protocol. The calling
/// process keeps its root, waits for the helper, and logs (instead of
/// dying on) `SIGINT` while the command runs.
///
/// # Errors
///
/// Returns [`BurrowError::Isolation`] if the helper cannot be forked or an
/// isolation step is rejected, and [`BurrowError::Launch`] if the command
/// cannot be started inside the root.
#[cfg(target_os = "linux")]
pub fn run_isolated(root: &Path, command: &str, args: &[String]) -> Result<Termination> {
    use std::fs::File;
    use std::io::{Read, Write};

    use nix::fcntl::OFlag;
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork, pipe2};

    let helper_err = |stage: &'static str, message: String| BurrowError::Isolation { stage, message };

    let (reader, writer) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| helper_err("fork", format!("pipe2 failed: {e}")))?;

    // Buffered output would otherwise be written twice.
    if let Err(e) = io::stdout().flush().and_then(|()| io::stderr().flush()) {
        tracing::debug!(error = %e, "could not flush standard streams before fork");
    }

    tracing::info!(root = %root.display(), command, "starting isolated command");

    // SAFETY: the child only runs the isolation protocol and then leaves
    // through `exit`, never returning into the caller's frames.
    match unsafe { fork() } {
        Err(e) => Err(helper_err("fork", format!("fork failed: {e}"))),
        Ok(ForkResult::Child) => {
            drop(reader);
            let report = HelperReport::run(root, command, args);
            let mut channel = File::from(writer);
            let code = i32::from(serde_json::to_writer(&mut channel, &report).is_err());
            drop(channel);
            std::process::exit(code)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(writer);
            install_interrupt_logger();

            let mut body = Vec::new();
            let read = File::from(reader).read_to_end(&mut body);

            let status = loop {
                match waitpid(child, None) {
                    Err(nix::errno::Errno::EINTR) => {}
                    other => break other,
                }
            }
            .map_err(|e| helper_err("wait", format!("waiting for helper failed: {e}")))?;
            tracing::debug!(?status, "helper exited");

            if let Err(e) = read {
                return Err(helper_err("helper", format!("reading helper report failed: {e}")));
            }
            if !body.is_empty() {
                let report: HelperReport = serde_json::from_slice(&body)
                    .map_err(|e| helper_err("helper", format!("malformed helper report: {e}")))?;
                tracing::debug!(?report, "helper report received");
                return report.into_result();
            }

            match status {
                WaitStatus::Signaled(_, signal, _) => Ok(Termination::Signaled(signal as i32)),
                other => Err(helper_err(
                    "helper",
                    format!("helper ended without a report ({other:?})"),
                )),
            }
        }
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns [`BurrowError::Isolation`]: PID namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn run_isolated(_root: &Path, _command: &str, _args: &[String]) -> Result<Termination> {
    Err(BurrowError::Isolation {
        stage: "unshare",
        message: "Linux required for PID namespace isolation".into(),
    })
}

#[cfg(target_os = "linux")]
fn install_interrupt_logger() {
    let installed = ctrlc::set_handler(|| {
        tracing::warn!("interrupt received, waiting for the container to exit");
    });
    match installed {
        Ok(()) | Err(ctrlc::Error::MultipleHandlers) => {}
        Err(e) => tracing::warn!(error = %e, "could not install interrupt handler"),
    }
}
