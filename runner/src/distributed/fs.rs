use super::util::{append_suffix, HOSTNAME};
use crate::executors::Outcome;
use nix::{errno::Errno, sys::signal, unistd::Pid};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info, trace, warn};

pub const CLAIMED_SUFFIX: &str = ".claimed";
pub const UNRESOLVED_SUFFIX: &str = ".unresolved";

/// Content written into a claimed marker
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ClaimRecord {
    pub host: String,
    pub pid: u32,
    // unix seconds
    pub claimed_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ClaimRecord {
    fn new() -> Self {
        Self {
            host: HOSTNAME.clone(),
            pid: process::id(),
            claimed_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
            outcome: None,
            reason: None,
        }
    }

    /// true if the claim belongs to this very process
    pub fn is_own(&self) -> bool {
        self.host == *HOSTNAME && self.pid == process::id()
    }

    /// The owner is known to be gone (same host, no such process) or the claim is older
    /// than `max_age`. Claims of live local processes are never stale.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        if self.host == *HOSTNAME {
            return !process_alive(self.pid);
        }

        age_of(UNIX_EPOCH + Duration::from_secs(self.claimed_at)) > max_age
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };

    // signal 0 only checks for existence, EPERM means it exists under another user
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn age_of(time: SystemTime) -> Duration {
    SystemTime::now().duration_since(time).unwrap_or_default()
}

/// Inspect a `<marker>.claimed` file left in a job folder and decide whether its owner
/// abandoned it. Claims held by this process are never stale. A file without a readable
/// record falls back to its modification time, the owner may still be writing it.
pub fn claim_is_stale(path: &Path, max_age: Duration) -> bool {
    let record = fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_yaml::from_str::<ClaimRecord>(&content).ok());

    match record {
        Some(record) if record.is_own() => false,
        Some(record) => record.is_stale(max_age),
        None => fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .map(|modified| age_of(modified) > max_age)
            .unwrap_or(false),
    }
}

#[derive(Debug)]
pub enum Claim {
    Claimed(ClaimedMarker),
    NotReady,
}

/// Claims job folders by renaming their ready marker
#[derive(Debug, Clone)]
pub struct JobGate {
    marker: String,
}

impl JobGate {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn claim(&self, dir: &Path) -> Claim {
        let marker = dir.join(&self.marker);
        let claimed = append_suffix(&marker, CLAIMED_SUFFIX);

        // rename is atomic, of several instances racing for the same marker only one succeeds
        // and all others see ENOENT
        match fs::rename(&marker, &claimed) {
            Ok(()) => {
                debug!(path = ?claimed, "Claimed job");

                let claimed = ClaimedMarker {
                    path: claimed,
                    marker,
                    record: ClaimRecord::new(),
                    resolved: false,
                };
                claimed.write_record();

                Claim::Claimed(claimed)
            }
            Err(error) => {
                match error.kind() {
                    ErrorKind::NotFound => {
                        trace!(path = ?marker, "No marker or claimed between check and rename")
                    }
                    ErrorKind::PermissionDenied => {
                        warn!(path = ?marker, "Failed to claim due to permission error")
                    }
                    _ => error!(path = ?marker, error = ?error, "Failed to rename marker for claiming"),
                }

                Claim::NotReady
            }
        }
    }
}

/// Claimed marker which is parked as unresolved on drop unless `complete` is called
#[derive(Debug)]
pub struct ClaimedMarker {
    path: PathBuf,
    marker: PathBuf,
    record: ClaimRecord,
    resolved: bool,
}

impl ClaimedMarker {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// the job ran, the marker is gone for good
    pub fn complete(mut self) {
        self.resolved = true;

        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Removed claimed marker"),
            Err(error) => warn!(path = ?self.path, error = ?error, "Failed to remove claimed marker"),
        }
    }

    /// the job was claimed but didn't run to completion, leave a record for an operator
    pub fn abandon(mut self, outcome: Outcome, reason: Option<String>) {
        self.record.outcome = Some(outcome);
        self.record.reason = reason;
        self.park();
    }

    fn park(&mut self) {
        self.resolved = true;
        self.write_record();

        let unresolved = append_suffix(&self.marker, UNRESOLVED_SUFFIX);

        match fs::rename(&self.path, &unresolved) {
            Ok(()) => info!(path = ?unresolved, outcome = ?self.record.outcome, "Job left unresolved"),
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to park claimed marker"),
        }
    }

    fn write_record(&self) {
        match serde_yaml::to_string(&self.record) {
            Ok(yaml) => {
                if let Err(error) = fs::write(&self.path, yaml) {
                    warn!(path = ?self.path, error = ?error, "Failed to write claim record");
                }
            }
            Err(error) => warn!(error = ?error, "Failed to serialize claim record"),
        }
    }
}

impl Drop for ClaimedMarker {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(path = ?self.path, "Claim dropped without being resolved");
            self.park();
        }
    }
}
