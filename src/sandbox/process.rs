//! Process launch for validated diagnostic commands
//!
//! Commands are spawned with a fixed argv (no shell), a closed stdin, a
//! per-call timeout and a cap on captured output. A child that outlives its
//! timeout is killed and reported as [`ExecutionFailure::Timeout`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::policy::{PolicyViolation, SandboxPolicy, ValidatedCommand};
use crate::metrics::{SANDBOX_EXECUTIONS, SANDBOX_REJECTIONS};

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Timeout in milliseconds (policy default if `None`)
    pub timeout_ms: Option<u64>,
    /// Working directory for the child; checked like a path argument.
    /// `/` when unset.
    pub cwd: Option<PathBuf>,
}

/// Captured result of a process that ran to completion
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 when the process was terminated by a signal
    pub exit_code: i32,
    pub duration_ms: f64,
    /// True when stdout or stderr hit the output cap
    pub truncated: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The process was allowed but did not produce a result
#[derive(Debug, Error)]
pub enum ExecutionFailure {
    #[error("'{program}' timed out after {timeout_ms}ms and was killed")]
    Timeout { program: String, timeout_ms: u64 },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything `Sandbox::execute` can fail with
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Rejected before spawn
    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    /// Ran (or tried to) and failed
    #[error(transparent)]
    Execution(#[from] ExecutionFailure),
}

impl SandboxError {
    /// Stable kind, for logs and callers that branch on "rejected" vs "failed"
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Policy(_) => "policy_violation",
            SandboxError::Execution(_) => "execution_failure",
        }
    }

    pub fn is_policy_violation(&self) -> bool {
        matches!(self, SandboxError::Policy(_))
    }
}

/// Validates and launches allow-listed programs
///
/// Cheap to clone; holds no mutable state, so concurrent calls are independent.
#[derive(Debug, Clone)]
pub struct Sandbox {
    policy: Arc<SandboxPolicy>,
}

impl Sandbox {
    pub fn new(policy: SandboxPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Validate without spawning
    pub fn check(&self, command: &str, args: &[String]) -> Result<ValidatedCommand, PolicyViolation> {
        self.policy.validate(command, args).map_err(|violation| {
            SANDBOX_REJECTIONS.with_label_values(&[command]).inc();
            warn!(command, reason = %violation.reason, "Sandbox rejected command");
            violation
        })
    }

    /// Validate, then run the program with the validated argv
    ///
    /// # Returns
    /// `ExecOutput` whatever the exit code; non-zero exits are for the caller
    /// to interpret. Timeouts and spawn failures are `ExecutionFailure`s.
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        opts: ExecOptions,
    ) -> Result<ExecOutput, SandboxError> {
        let validated = self.check(command, args)?;
        let cwd = self.working_dir(command, opts.cwd)?;
        let timeout_ms = opts.timeout_ms.unwrap_or(self.policy.timeout_ms);
        let result = run(&validated, timeout_ms, cwd, self.policy.max_output_bytes).await;

        let status = match &result {
            Ok(output) if output.success() => "success",
            Ok(_) => "nonzero_exit",
            Err(ExecutionFailure::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        SANDBOX_EXECUTIONS.with_label_values(&[command, status]).inc();

        Ok(result?)
    }

    fn working_dir(&self, command: &str, cwd: Option<PathBuf>) -> Result<PathBuf, PolicyViolation> {
        let dir = match cwd {
            Some(dir) => dir,
            None => return Ok(PathBuf::from("/")),
        };
        self.policy
            .resolve_path(&dir.to_string_lossy())
            .map_err(|reason| {
                SANDBOX_REJECTIONS.with_label_values(&[command]).inc();
                warn!(command, reason = %reason, "Sandbox rejected working directory");
                PolicyViolation {
                    command: command.to_string(),
                    reason,
                }
            })
    }
}

async fn run(
    validated: &ValidatedCommand,
    timeout_ms: u64,
    cwd: PathBuf,
    max_output_bytes: usize,
) -> Result<ExecOutput, ExecutionFailure> {
    let program = validated.program.clone();
    let start = Instant::now();

    let mut cmd = Command::new(&validated.program);
    cmd.args(&validated.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .current_dir(cwd);

    debug!(program = %program, args = ?validated.args, timeout_ms, "Spawning sandboxed command");

    let mut child = cmd.spawn().map_err(|source| ExecutionFailure::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let collect = async {
        let (out, err, status) = tokio::join!(
            read_capped(stdout, max_output_bytes),
            read_capped(stderr, max_output_bytes),
            child.wait()
        );
        Ok::<_, std::io::Error>((out?, err?, status?))
    };

    match tokio::time::timeout(Duration::from_millis(timeout_ms), collect).await {
        Ok(Ok(((stdout, out_truncated), (stderr, err_truncated), status))) => Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
            truncated: out_truncated || err_truncated,
        }),
        Ok(Err(source)) => Err(ExecutionFailure::Io { program, source }),
        Err(_) => {
            // The collect future is gone; kill explicitly rather than waiting for drop
            if let Err(e) = child.start_kill() {
                warn!(program = %program, error = %e, "Failed to kill timed-out child");
            }
            let _ = child.wait().await;
            warn!(program = %program, timeout_ms, "Sandboxed command timed out");
            Err(ExecutionFailure::Timeout {
                program,
                timeout_ms,
            })
        }
    }
}

/// Read up to `cap` bytes, then drain and discard the rest so the child never
/// blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> std::io::Result<(String, bool)>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok((String::new(), false));
    };

    let mut buf = Vec::with_capacity(cap.min(8192));
    (&mut reader).take(cap as u64).read_to_end(&mut buf).await?;
    let discarded = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;

    Ok((String::from_utf8_lossy(&buf).into_owned(), discarded > 0))
}
