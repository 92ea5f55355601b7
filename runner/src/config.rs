use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Error,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid: {}", .0.join(", "))]
    InvalidGlobs(Vec<String>),
    #[error("Walk mode '{0}' is not supported, use natural, random or time")]
    UnsupportedWalkMode(String),
    #[error("Failed to read config file {path:?}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Failed to parse config file {path:?}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Failed to create work dir {path:?}")]
    CreateWorkDir {
        path: PathBuf,
        #[source]
        source: Error,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // shared root that is scanned for job folders
    #[serde(default = "default_remote_root")]
    pub remote_root: PathBuf,
    // node-local root for staging copies
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub walk: WalkConfig,
    #[serde(default)]
    pub job: JobLayout,
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub jitter: JitterConfig,
}

/// Order in which the scan loop visits subdirectories
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WalkMode {
    Natural,
    #[default]
    Random,
    #[serde(alias = "time-ordered")]
    Time,
}

impl FromStr for WalkMode {
    type Err = ConfigErrors;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "natural" => Ok(Self::Natural),
            "random" => Ok(Self::Random),
            "time" | "time-ordered" => Ok(Self::Time),
            other => Err(ConfigErrors::UnsupportedWalkMode(other.to_string())),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct WalkConfig {
    #[serde(default)]
    pub mode: WalkMode,
    // only used by the time ordered walk, newest first when set
    #[serde(default)]
    pub reverse: bool,
}

/// File naming convention of a job folder
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct JobLayout {
    // exact name of the ready marker that gets claimed
    pub marker: String,
    // glob which flags a directory as a job candidate during the scan
    pub marker_glob: String,
    pub weather: String,
    pub model: String,
    pub version: String,
    // a claim of another node turns stale after this long, local claims as soon as
    // their process is gone
    pub stale_claim_secs: u64,
}

impl Default for JobLayout {
    fn default() -> Self {
        Self {
            marker: "runit.runit".to_string(),
            marker_glob: "*.runit".to_string(),
            weather: "*.epw".to_string(),
            model: "*.idf".to_string(),
            version: "*.vrs".to_string(),
            stale_claim_secs: 24 * 60 * 60,
        }
    }
}

/// Compiled matchers for `JobLayout`, matched against bare file names
#[derive(Clone, Debug)]
pub struct JobPatterns {
    pub marker: GlobMatcher,
    pub weather: GlobMatcher,
    pub model: GlobMatcher,
    pub version: GlobMatcher,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Live,
    Capture,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct ToolConfig {
    // executable path, `{version}` and `{dotted_version}` are substituted from the version tag
    pub executable: String,
    pub shell: PathBuf,
    // prefix the command with `set -x;`
    pub trace: bool,
    pub output: OutputMode,
    pub timeout_secs: Option<u64>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            executable: "/usr/local/EnergyPlus-{version}/energyplus-{dotted_version}".to_string(),
            shell: PathBuf::from("/bin/bash"),
            trace: true,
            output: OutputMode::Live,
            timeout_secs: None,
        }
    }
}

impl ToolConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct JitterConfig {
    pub max_ms: u64,
    pub step_ms: u64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            max_ms: 1000,
            step_ms: 100,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            remote_root: default_remote_root(),
            work_dir: default_work_dir(),
            walk: WalkConfig::default(),
            job: JobLayout::default(),
            tool: ToolConfig::default(),
            jitter: JitterConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// read a yaml config file, missing fields fall back to their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|source| ConfigErrors::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_reader(file).map_err(|source| ConfigErrors::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Compile all globs of the job layout
    pub fn compile_patterns(&self) -> Result<JobPatterns, Vec<(String, globset::Error)>> {
        let mut errors = Vec::new();
        let mut compile = |name: &str, glob: &str| match Glob::new(glob) {
            Ok(glob) => Some(glob.compile_matcher()),
            Err(error) => {
                errors.push((name.to_string(), error));
                None
            }
        };

        let marker = compile("job.marker_glob", &self.job.marker_glob);
        let weather = compile("job.weather", &self.job.weather);
        let model = compile("job.model", &self.job.model);
        let version = compile("job.version", &self.job.version);

        match (marker, weather, model, version) {
            (Some(marker), Some(weather), Some(model), Some(version)) => Ok(JobPatterns {
                marker,
                weather,
                model,
                version,
            }),
            _ => Err(errors),
        }
    }

    /// create the staging root if it doesn't exist yet
    pub fn prepare_work_dir(&self) -> Result<(), ConfigErrors> {
        if self.work_dir.is_dir() {
            return Ok(());
        }

        info!(path = ?self.work_dir, "Creating work dir");
        fs::create_dir_all(&self.work_dir).map_err(|source| ConfigErrors::CreateWorkDir {
            path: self.work_dir.clone(),
            source,
        })
    }

    /// Returns true if the config contains an error, every problem is logged before returning
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if !self.remote_root.is_dir() {
            error!(
                "remote_root {} is not a directory or not reachable",
                self.remote_root.to_string_lossy()
            );
            contains_error = true;
        }

        if let Err(error) = self.prepare_work_dir() {
            error!(error = ?error, "{error}");
            contains_error = true;
        }

        match self.compile_patterns() {
            Ok(patterns) => {
                if !patterns.marker.is_match(&self.job.marker) {
                    warn!(
                        "job.marker '{}' doesn't match job.marker_glob '{}', jobs will never be picked up",
                        self.job.marker, self.job.marker_glob
                    );
                }
            }
            Err(compile_errors) => {
                for (name, error) in compile_errors {
                    error!("Failed to compile glob for {name}: {error}");
                }
                contains_error = true;
            }
        }

        if self.jitter.max_ms > 0 && self.jitter.step_ms == 0 {
            error!("jitter.step_ms cannot be 0 while jitter.max_ms is {}", self.jitter.max_ms);
            contains_error = true;
        }

        if !self.tool.executable.contains("{version}")
            && !self.tool.executable.contains("{dotted_version}")
        {
            warn!(
                "tool.executable '{}' ignores the version tag of the jobs",
                self.tool.executable
            );
        }

        contains_error
    }
}

fn default_remote_root() -> PathBuf {
    PathBuf::from("/mnt/remote/project/")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/epTemp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let config: RunnerConfig = serde_yaml::from_str(
            "remote_root: /data/jobs\nwalk:\n  mode: time\n  reverse: true\n",
        )
        .unwrap();

        assert_eq!(config.remote_root, PathBuf::from("/data/jobs"));
        assert_eq!(config.work_dir, PathBuf::from("/epTemp"));
        assert_eq!(config.walk.mode, WalkMode::Time);
        assert!(config.walk.reverse);
        assert_eq!(config.job.marker, "runit.runit");
        assert_eq!(config.tool.output, OutputMode::Live);
        assert_eq!(config.tool.timeout(), None);
        assert_eq!(config.jitter.max_ms, 1000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<RunnerConfig>("remote_rot: /data\n").is_err());
    }

    #[test]
    fn walk_mode_from_str() {
        assert_eq!("natural".parse::<WalkMode>().unwrap(), WalkMode::Natural);
        assert_eq!("Random".parse::<WalkMode>().unwrap(), WalkMode::Random);
        assert_eq!("time-ordered".parse::<WalkMode>().unwrap(), WalkMode::Time);
        assert!(matches!(
            "sideways".parse::<WalkMode>(),
            Err(ConfigErrors::UnsupportedWalkMode(mode)) if mode == "sideways"
        ));
    }

    #[test]
    fn default_patterns_match_job_files() {
        let patterns = RunnerConfig::default().compile_patterns().unwrap();

        assert!(patterns.marker.is_match("runit.runit"));
        assert!(!patterns.marker.is_match("runit.runit.claimed"));
        assert!(!patterns.marker.is_match("runit.runit.unresolved"));
        assert!(patterns.weather.is_match("USA_CO_Golden.epw"));
        assert!(patterns.model.is_match("office.idf"));
        assert!(patterns.version.is_match("9-4-0.vrs"));
    }

    #[test]
    fn invalid_globs_are_reported_by_name() {
        let mut config = RunnerConfig::default();
        config.job.model = "[*.idf".to_string();

        let errors = config.compile_patterns().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "job.model");
    }

    #[test]
    fn preflight_creates_work_dir_and_flags_missing_root() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = RunnerConfig::default();
        config.remote_root = temp.path().join("missing");
        config.work_dir = temp.path().join("work").join("nested");

        assert!(config.preflight_checks());
        assert!(config.work_dir.is_dir());

        config.remote_root = temp.path().to_path_buf();
        assert!(!config.preflight_checks());
    }

    #[test]
    fn preflight_rejects_zero_jitter_step() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = RunnerConfig::default();
        config.remote_root = temp.path().to_path_buf();
        config.work_dir = temp.path().to_path_buf();
        config.jitter.step_ms = 0;

        assert!(config.preflight_checks());
    }

    #[test]
    fn load_reports_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("simwatch.yaml");

        assert!(matches!(
            RunnerConfig::load(&path),
            Err(ConfigErrors::ReadConfig { .. })
        ));

        fs::write(&path, "work_dir: /scratch\njitter:\n  max_ms: 0\n").unwrap();
        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/scratch"));
        assert_eq!(config.jitter.max_ms, 0);
        assert_eq!(config.jitter.step_ms, 100);
    }
}
