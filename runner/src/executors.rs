pub mod local;
pub mod staging;

pub use local::StagingExecutor;

use crate::{collector::WalkError, config::JobPatterns, process::ProcessError};
use globset::GlobMatcher;
use itertools::Itertools;
use serde_repr::{Deserialize_repr, Serialize_repr};
use staging::StagingError;
use std::{
    error::Error as _,
    ffi::OsString,
    fmt::Write as _,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::warn;

/// Result of a single attempt to run a job folder
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Hash, Debug, Clone, Copy)]
#[repr(i8)]
pub enum Outcome {
    Success = 0,
    /// claimed, but weather, model or version tag are absent
    MissingInputs = -1,
    /// no ready marker, nothing was touched
    NoMarker = -2,
    Failure = 1,
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to list job folder")]
    ListJob(#[from] WalkError),
    #[error("Job folder {0:?} has no base name")]
    NoBaseName(PathBuf),
    #[error("Failed to stage job into {path:?}")]
    Staging {
        path: PathBuf,
        #[source]
        source: StagingError,
    },
    #[error("Failed to run the simulation")]
    Process(#[from] ProcessError),
    #[error("Failed to merge outputs back into {path:?}")]
    Merge {
        path: PathBuf,
        #[source]
        source: StagingError,
    },
}

impl ExecutorError {
    /// the error message followed by all of its sources
    pub fn chain(&self) -> String {
        let mut message = self.to_string();
        let mut source = self.source();

        while let Some(error) = source {
            let _ = write!(message, ": {error}");
            source = error.source();
        }

        message
    }
}

/// Required inputs of a job folder, file names relative to the folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInputs {
    pub weather: OsString,
    pub model: OsString,
    /// stem of the version tag file, e.g. `9-4-0`
    pub version: String,
}

impl JobInputs {
    /// classify the files of a job folder, returns the names of the missing roles on failure
    pub fn discover(files: &[OsString], patterns: &JobPatterns) -> Result<Self, Vec<&'static str>> {
        let weather = pick(files, &patterns.weather, "weather");
        let model = pick(files, &patterns.model, "model");
        let version = pick(files, &patterns.version, "version").and_then(|name| {
            Path::new(name)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        });

        match (weather, model, version) {
            (Some(weather), Some(model), Some(version)) => Ok(Self {
                weather: weather.clone(),
                model: model.clone(),
                version,
            }),
            (weather, model, version) => Err([
                weather.is_none().then_some("weather"),
                model.is_none().then_some("model"),
                version.is_none().then_some("version"),
            ]
            .into_iter()
            .flatten()
            .collect()),
        }
    }

    /// `9-4-0` -> `9.4.0`
    pub fn dotted_version(&self) -> String {
        self.version.replace('-', ".")
    }
}

fn pick<'a>(files: &'a [OsString], matcher: &GlobMatcher, role: &str) -> Option<&'a OsString> {
    let candidates = files
        .iter()
        .filter(|name| matcher.is_match(name))
        .sorted()
        .collect_vec();

    if candidates.len() > 1 {
        warn!(
            candidates = ?candidates,
            "Found {} {role} files, using {:?}",
            candidates.len(),
            candidates[0]
        );
    }

    candidates.first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;

    fn files(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    #[test]
    fn discover_complete_job() {
        let patterns = RunnerConfig::default().compile_patterns().unwrap();
        let inputs = JobInputs::discover(
            &files(&["runit.runit.claimed", "Golden.epw", "office.idf", "9-4-0.vrs"]),
            &patterns,
        )
        .unwrap();

        assert_eq!(inputs.weather, "Golden.epw");
        assert_eq!(inputs.model, "office.idf");
        assert_eq!(inputs.version, "9-4-0");
        assert_eq!(inputs.dotted_version(), "9.4.0");
    }

    #[test]
    fn discover_reports_missing_roles() {
        let patterns = RunnerConfig::default().compile_patterns().unwrap();

        assert_eq!(
            JobInputs::discover(&files(&["office.idf"]), &patterns),
            Err(vec!["weather", "version"])
        );
        assert_eq!(
            JobInputs::discover(&[], &patterns),
            Err(vec!["weather", "model", "version"])
        );
    }

    #[test]
    fn discover_prefers_first_name_when_ambiguous() {
        let patterns = RunnerConfig::default().compile_patterns().unwrap();
        let inputs = JobInputs::discover(
            &files(&["b.idf", "w.epw", "a.idf", "23-1-0.vrs"]),
            &patterns,
        )
        .unwrap();

        assert_eq!(inputs.model, "a.idf");
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(serde_yaml::to_string(&Outcome::MissingInputs).unwrap().trim(), "-1");
        assert_eq!(
            serde_yaml::from_str::<Outcome>("-2").unwrap(),
            Outcome::NoMarker
        );
    }

    #[test]
    fn chain_includes_sources() {
        let error = ExecutorError::Process(ProcessError::ChildError(std::io::Error::new(
            std::io::ErrorKind::Other,
            "broken pipe",
        )));

        assert_eq!(
            error.chain(),
            "Failed to run the simulation: Failed to wait for a child proccess: broken pipe"
        );
    }
}
