use super::{
    staging::{merge_back, StagingCopy},
    ExecutorError, JobInputs, Outcome,
};
use crate::{
    collector::list_dir,
    config::{JobPatterns, OutputMode, RunnerConfig, ToolConfig},
    distributed::fs::{Claim, JobGate},
    process::ProcessRunner,
};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

/// Executor that runs one job at a time on a node-local copy of the job folder
#[derive(Debug, Clone)]
pub struct StagingExecutor {
    gate: JobGate,
    patterns: JobPatterns,
    work_dir: PathBuf,
    tool: ToolConfig,
    runner: ProcessRunner,
}

impl StagingExecutor {
    pub fn load(config: &RunnerConfig, patterns: JobPatterns) -> Self {
        Self {
            gate: JobGate::new(config.job.marker.clone()),
            patterns,
            work_dir: config.work_dir.clone(),
            tool: config.tool.clone(),
            runner: ProcessRunner::new(config.tool.shell.clone(), config.tool.timeout()),
        }
    }

    pub fn patterns(&self) -> &JobPatterns {
        &self.patterns
    }

    /// claim, stage, simulate and merge a single job folder
    #[instrument(skip(self), level = "info")]
    pub fn execute(&self, dir: &Path) -> Outcome {
        let claimed = match self.gate.claim(dir) {
            Claim::Claimed(claimed) => claimed,
            Claim::NotReady => return Outcome::NoMarker,
        };

        // from here on the marker is consumed, every exit has to resolve the claim
        let files = match list_dir(dir) {
            Ok((_, files)) => files,
            Err(error) => {
                let error = ExecutorError::from(error);
                error!(error = ?error, "Failed to inspect job: {}", error.chain());
                claimed.abandon(Outcome::Failure, Some(error.chain()));

                return Outcome::Failure;
            }
        };

        let inputs = match JobInputs::discover(&files, &self.patterns) {
            Ok(inputs) => inputs,
            Err(missing) => {
                warn!(missing = ?missing, "Job is missing required inputs, leaving it unresolved");
                claimed.abandon(
                    Outcome::MissingInputs,
                    Some(format!("missing {} file", missing.join(", "))),
                );

                return Outcome::MissingInputs;
            }
        };

        info!(
            weather = ?inputs.weather,
            model = ?inputs.model,
            version = %inputs.version,
            "Running job"
        );

        match self.run_staged(dir, &inputs) {
            Ok(status) => {
                // the exit status is informational only, whatever the tool produced is merged
                if status != 0 {
                    warn!(status, "Simulation exited with a non-zero status");
                }
                claimed.complete();

                Outcome::Success
            }
            Err(error) => {
                error!(error = ?error, "Job failed: {}", error.chain());
                claimed.abandon(Outcome::Failure, Some(error.chain()));

                Outcome::Failure
            }
        }
    }

    fn run_staged(&self, dir: &Path, inputs: &JobInputs) -> Result<i32, ExecutorError> {
        let name = dir
            .file_name()
            .ok_or_else(|| ExecutorError::NoBaseName(dir.to_path_buf()))?;
        let path = self.work_dir.join(name);

        let staging = StagingCopy::create(path.clone(), dir)
            .map_err(|source| ExecutorError::Staging { path, source })?;

        let command = self.command_line(inputs, staging.path());
        info!("{command}");

        let status = match self.tool.output {
            OutputMode::Live => self.runner.run_live(&command)?,
            OutputMode::Capture => {
                let output = self.runner.run_capture(&command)?;
                debug!(
                    runtime = ?output.runtime,
                    stdout = %output.stdout,
                    stderr = %output.stderr,
                    "Captured simulation output"
                );

                output.status
            }
        };

        let merged = merge_back(staging.path(), dir).map_err(|source| ExecutorError::Merge {
            path: dir.to_path_buf(),
            source,
        })?;
        info!(merged = ?merged, "Merged {} new outputs", merged.len());

        Ok(status)
    }

    /// shell command for the staged job, e.g.
    /// `set -x; /usr/local/EnergyPlus-9-4-0/energyplus-9.4.0 -w "<w>" -d "<dir>" "<idf>"`
    pub fn command_line(&self, inputs: &JobInputs, staging: &Path) -> String {
        let executable = self
            .tool
            .executable
            .replace("{version}", &inputs.version)
            .replace("{dotted_version}", &inputs.dotted_version());

        format!(
            "{}{executable} -w {} -d {} {}",
            if self.tool.trace { "set -x; " } else { "" },
            quote(&staging.join(&inputs.weather)),
            quote(staging),
            quote(&staging.join(&inputs.model)),
        )
    }
}

/// double quote a path for the shell
fn quote(path: &Path) -> String {
    let mut quoted = String::from("\"");

    for character in path.to_string_lossy().chars() {
        if matches!(character, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(character);
    }

    quoted.push('"');
    quoted
}
