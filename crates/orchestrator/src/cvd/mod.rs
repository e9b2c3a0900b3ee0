use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};

pub mod fleet;

pub use fleet::{Fleet, Group, Instance};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_ANDROID_HOST_OUT: &str = "ANDROID_HOST_OUT";
const ENV_HOME: &str = "HOME";

/// Builds the command for `program` with `args`. Swapped out in tests to run
/// fake tools.
pub type ExecContext = Arc<dyn Fn(&str, &[String]) -> Command + Send + Sync>;

pub fn default_exec_context() -> ExecContext {
    Arc::new(|program: &str, args: &[String]| {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    })
}

#[derive(Debug, Error)]
pub enum CvdCommandError {
    #[error("cvd execution with args \"{}\" failed with stderr:\n{stderr}", .args.join(" "))]
    Exec {
        args: Vec<String>,
        stderr: String,
        status: ExitStatus,
    },
    #[error("cvd execution with args \"{}\" timed out", .args.join(" "))]
    Timeout { args: Vec<String> },
    #[error("failed to run cvd: {0}")]
    Spawn(#[from] io::Error),
    #[error("failed to start cvd server: {0}")]
    ServerStart(ExitStatus),
}

impl CvdCommandError {
    /// One line description without the captured output.
    pub fn summary(&self) -> String {
        match self {
            CvdCommandError::Exec { status, .. } => status.to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CvdCommandOpts {
    pub android_host_out: Option<PathBuf>,
    pub home: Option<PathBuf>,
    // Falls back to `DEFAULT_TIMEOUT`.
    pub timeout: Option<Duration>,
    pub capture_stdout: bool,
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Runs `cmd` in its own process group with a hard deadline.
///
/// On expiry the whole group gets `SIGINT` and the child is awaited. `SIGKILL`
/// is never used as `sudo` only relays interrupt-class signals to the tool.
pub async fn run_command(
    mut cmd: Command,
    timeout: Duration,
    capture_stdout: bool,
) -> io::Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().map(read_all);
    let stderr = child.stderr.take().map(read_all);

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?, false),
        Err(_) => {
            interrupt(&child);
            (child.wait().await?, true)
        }
    };

    Ok(CommandOutput {
        status,
        stdout: collect(stdout).await,
        stderr: collect(stderr).await,
        timed_out,
    })
}

fn read_all<R: AsyncRead + Unpin + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(err) = reader.read_to_end(&mut buf).await {
            tracing::debug!("failed reading process output: {err}");
        }
        buf
    })
}

async fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

fn interrupt(child: &Child) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    tracing::warn!("deadline exceeded; sending SIGINT to process group {pid}");
    // SAFETY: plain syscall on a pid we own; a negative pid targets the group.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGINT) };
    if rc != 0 {
        tracing::error!(
            "error sending SIGINT to process group {pid}: {}",
            io::Error::last_os_error()
        );
    }
}

pub fn cmd_output_log_message(output: &str) -> String {
    format!(
        "############################################\n\
         ## BEGIN \n\
         ############################################\n\
         \n{output}\n\n\
         ############################################\n\
         ## END \n\
         ############################################\n"
    )
}

/// Executes the `cvd` tool as the unprivileged cvd user.
pub struct CvdRunner {
    exec: ExecContext,
    cvd_user: String,
    cvd_bin: PathBuf,
}

impl CvdRunner {
    pub fn new(exec: ExecContext, cvd_user: &str, cvd_bin: &Path) -> Self {
        CvdRunner {
            exec,
            cvd_user: cvd_user.to_string(),
            cvd_bin: cvd_bin.to_path_buf(),
        }
    }

    pub fn exec_context(&self) -> &ExecContext {
        &self.exec
    }

    pub fn cvd_user(&self) -> &str {
        &self.cvd_user
    }

    /// Runs `cvd args` and returns its stdout (empty unless captured).
    pub async fn run(
        &self,
        args: &[String],
        opts: &CvdCommandOpts,
    ) -> Result<Vec<u8>, CvdCommandError> {
        self.start_server().await?;

        let cmd = self.build_command(opts.android_host_out.as_deref(), opts.home.as_deref(), args);
        let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let output = run_command(cmd, timeout, opts.capture_stdout).await?;

        if output.timed_out || !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            tracing::error!(
                "`cvd {}`, stderr:\n{}",
                args.join(" "),
                cmd_output_log_message(&stderr)
            );

            if output.timed_out {
                return Err(CvdCommandError::Timeout {
                    args: args.to_vec(),
                });
            }
            return Err(CvdCommandError::Exec {
                args: args.to_vec(),
                stderr,
                status: output.status,
            });
        }

        Ok(output.stdout)
    }

    // The server daemonizes and inherits the child's stdio; pipes would
    // never reach EOF, hence the null device.
    async fn start_server(&self) -> Result<(), CvdCommandError> {
        let mut cmd = self.build_command(None, None, &[]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let status = cmd.status().await?;
        if !status.success() {
            return Err(CvdCommandError::ServerStart(status));
        }
        Ok(())
    }

    /// `sudo -u <user> HOME=<home> [ANDROID_HOST_OUT=<dir>] <cvd> args...`
    fn build_command(
        &self,
        android_host_out: Option<&Path>,
        home: Option<&Path>,
        args: &[String],
    ) -> Command {
        let home = home.map(|p| p.display().to_string()).unwrap_or_default();
        let mut sudo_args = vec![
            "-u".to_string(),
            self.cvd_user.clone(),
            format!("{ENV_HOME}={home}"),
        ];
        if let Some(dir) = android_host_out {
            sudo_args.push(format!("{ENV_ANDROID_HOST_OUT}={}", dir.display()));
        }
        sudo_args.push(self.cvd_bin.display().to_string());
        sudo_args.extend(args.iter().cloned());

        (self.exec)("sudo", &sudo_args)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Runs `sudo -u <user> VAR=.. <bin> args` as `env VAR=.. sh <bin> args`,
    /// so shell scripts stand in for real tools without becoming executable.
    pub(crate) fn sh_exec_context() -> ExecContext {
        Arc::new(|program: &str, args: &[String]| {
            let args: Vec<String> = if program == "sudo" {
                args.iter().skip(2).cloned().collect()
            } else {
                std::iter::once(program.to_string())
                    .chain(args.iter().cloned())
                    .collect()
            };

            let (env, rest): (Vec<_>, Vec<_>) = {
                let split = args
                    .iter()
                    .position(|arg| !arg.contains('='))
                    .unwrap_or(args.len());
                (args[..split].to_vec(), args[split..].to_vec())
            };

            let mut cmd = Command::new("env");
            cmd.args(env).arg("sh").args(rest);
            cmd
        })
    }

    pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        path
    }
}
