use crate::{
    collector::{Collector, WalkError},
    config::{ConfigErrors, JitterConfig, RunnerConfig},
    distributed::fs::{claim_is_stale, CLAIMED_SUFFIX, UNRESOLVED_SUFFIX},
    executors::{Outcome, StagingExecutor},
};
use rand::Rng;
use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to walk remote root {0:?}")]
    Root(PathBuf, #[source] WalkError),
}

/// Counters of a single pass over the remote root
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub visited: usize,
    pub success: usize,
    pub missing_inputs: usize,
    pub no_marker: usize,
    pub failure: usize,
    /// folders still carrying an unresolved claim from an earlier attempt
    pub unresolved: usize,
    /// folders whose claim outlived its owner, e.g. after a crash or a killed instance
    pub stale_claims: usize,
    /// directories that couldn't be listed
    pub skipped: usize,
}

impl ScanReport {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::MissingInputs => self.missing_inputs += 1,
            Outcome::NoMarker => self.no_marker += 1,
            Outcome::Failure => self.failure += 1,
        }
    }

    pub fn attempted(&self) -> usize {
        self.success + self.missing_inputs + self.no_marker + self.failure
    }
}

/// Random pause between scans to spread out instances started at the same time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    max: Duration,
    step: Duration,
}

impl Jitter {
    pub fn load(config: &JitterConfig) -> Self {
        Self {
            max: Duration::from_millis(config.max_ms),
            step: Duration::from_millis(config.step_ms),
        }
    }

    /// a multiple of `step` between zero and `max`, both inclusive
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.step.is_zero() {
            return Duration::ZERO;
        }

        let steps = u32::try_from(self.max.as_millis() / self.step.as_millis())
            .unwrap_or(u32::MAX);
        self.step * rng.random_range(0..=steps)
    }

    pub fn sleep(&self) {
        let pause = self.sample(&mut rand::rng());
        debug!("Sleeping for {pause:?}");

        thread::sleep(pause);
    }
}

/// The polling loop of a single instance
#[derive(Debug)]
pub struct Scanner {
    root: PathBuf,
    collector: Collector,
    executor: StagingExecutor,
    jitter: Jitter,
    unresolved_name: String,
    claimed_name: String,
    stale_after: Duration,
}

impl Scanner {
    pub fn load(config: &RunnerConfig) -> Result<Self, ConfigErrors> {
        let patterns = config.compile_patterns().map_err(|compile_errors| {
            ConfigErrors::InvalidGlobs(
                compile_errors
                    .into_iter()
                    .map(|(name, error)| {
                        error!("Failed to compile glob for {name}: {error}");
                        name
                    })
                    .collect(),
            )
        })?;

        Ok(Self {
            root: config.remote_root.clone(),
            collector: Collector::load(&config.walk),
            executor: StagingExecutor::load(config, patterns),
            jitter: Jitter::load(&config.jitter),
            unresolved_name: format!("{}{UNRESOLVED_SUFFIX}", config.job.marker),
            claimed_name: format!("{}{CLAIMED_SUFFIX}", config.job.marker),
            stale_after: Duration::from_secs(config.job.stale_claim_secs),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// walk the remote root once and run every job folder that carries a marker
    #[instrument(skip(self), level = "info")]
    pub fn scan(&self) -> Result<ScanReport, ScanError> {
        info!(root = ?self.root, "Scanning folder");

        let mut report = ScanReport::default();
        let mut walker = self.collector.walk(&self.root);
        let marker = &self.executor.patterns().marker;

        while let Some(level) = walker.next_level() {
            let level = match level {
                Ok(level) => level,
                Err(error) if error.path == self.root => {
                    return Err(ScanError::Root(self.root.clone(), error));
                }
                Err(error) => {
                    warn!(error = ?error, "Skipping directory: {error}");
                    report.skipped += 1;
                    continue;
                }
            };
            report.visited += 1;

            // one attempt per directory, no matter how many files look like a marker
            if level.files.iter().any(|name| marker.is_match(name)) {
                report.record(self.executor.execute(&level.path));
            }

            if level.files.iter().any(|name| *name == *self.unresolved_name) {
                report.unresolved += 1;
            }

            if level.files.iter().any(|name| *name == *self.claimed_name) {
                let claimed = level.path.join(&self.claimed_name);

                if claim_is_stale(&claimed, self.stale_after) {
                    warn!(path = ?claimed, "Found stale claim");
                    report.stale_claims += 1;
                }
            }
        }

        Ok(report)
    }

    /// Scan forever, or a single time if `once` is set. Errors never end the loop.
    pub fn run(&self, once: bool) {
        // desynchronize instances that were started together
        self.jitter.sleep();

        loop {
            match self.scan() {
                Ok(report) => {
                    info!(
                        visited = report.visited,
                        success = report.success,
                        missing_inputs = report.missing_inputs,
                        no_marker = report.no_marker,
                        failure = report.failure,
                        unresolved = report.unresolved,
                        stale_claims = report.stale_claims,
                        skipped = report.skipped,
                        "Scan finished"
                    );

                    if report.unresolved > 0 {
                        warn!(
                            "{} job folders carry an unresolved claim and need to be re-armed by hand",
                            report.unresolved
                        );
                    }

                    if report.stale_claims > 0 {
                        warn!(
                            "{} job folders carry a claim whose owner is gone and need to be re-armed by hand",
                            report.stale_claims
                        );
                    }
                }
                Err(error) => error!(error = ?error, "Scan failed: {error}"),
            }

            if once {
                break;
            }

            self.jitter.sleep();
        }
    }
}
