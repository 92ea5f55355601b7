use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    io::Read,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {shell:?}")]
    Spawn {
        shell: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to wait for a child proccess")]
    ChildError(#[from] std::io::Error),
    #[error("Process timed out after {0:?}")]
    ChildTimeout(Duration),
}

#[derive(Debug, Clone)]
/// container for everything a captured run produced
pub struct RunOutput {
    pub runtime: Duration,
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

/// Runs command lines through a shell, blocking until they finish
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(shell: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            shell: shell.into(),
            timeout,
        }
    }

    /// run `command` and collect stdout, stderr and the exit code without printing anything
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn run_capture(&self, command: &str) -> Result<RunOutput, ProcessError> {
        let start = Instant::now();
        let mut child = self.spawn(command, Stdio::piped(), Stdio::piped())?;

        // drain both pipes on their own threads, a chatty child would block on a full pipe
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = self.wait(&mut child)?;

        Ok(RunOutput {
            runtime: start.elapsed(),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
            status: exit_code(status),
        })
    }

    /// run `command` with output going straight to the terminal, returns the exit code
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn run_live(&self, command: &str) -> Result<i32, ProcessError> {
        let mut child = self.spawn(command, Stdio::inherit(), Stdio::inherit())?;

        self.wait(&mut child).map(exit_code)
    }

    fn spawn(&self, command: &str, stdout: Stdio, stderr: Stdio) -> Result<Child, ProcessError> {
        let mut shell = Command::new(&self.shell);
        shell
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        // a timeout has to take down everything the shell started, not only the shell
        if self.timeout.is_some() {
            shell.process_group(0);
        }

        shell
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                shell: self.shell.clone(),
                source,
            })
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, ProcessError> {
        debug!("Waiting on {}", child.id());

        match self.timeout {
            None => Ok(child.wait()?),
            Some(timeout) => match child.wait_timeout(timeout)? {
                Some(status) => Ok(status),
                None => {
                    warn!("Child {} ran into timeout after {timeout:?}, killing it", child.id());
                    kill_group(child)?;
                    child.wait()?;

                    Err(ProcessError::ChildTimeout(timeout))
                }
            },
        }
    }
}

fn kill_group(child: &mut Child) -> Result<(), ProcessError> {
    let group = i32::try_from(child.id()).map(Pid::from_raw);

    match group.map(|group| killpg(group, Signal::SIGKILL)) {
        Ok(Ok(())) => Ok(()),
        result => {
            warn!(result = ?result, "Failed to kill process group of {}", child.id());
            Ok(child.kill()?)
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();

        if let Some(mut pipe) = pipe {
            if let Err(error) = pipe.read_to_end(&mut buffer) {
                warn!(error = ?error, "Failed to read child output");
            }
        }

        String::from_utf8_lossy(&buffer).into_owned()
    })
}

/// exit code of the process, or the negated signal number if it was killed
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}
