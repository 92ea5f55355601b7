use crate::config::{WalkConfig, WalkMode};
use ignore::WalkBuilder;
use itertools::Itertools;
use rand::seq::SliceRandom;
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
#[error("Failed to list directory {path:?}")]
pub struct WalkError {
    pub path: PathBuf,
    #[source]
    pub source: ignore::Error,
}

/// All possible traversal orders
/// (this is deliberately not made with dynamic dispatch to avoid the headache)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collector {
    /// order as returned by the filesystem
    Natural,
    /// subdirectories are shuffled on every level
    Random,
    /// subdirectories sorted by modification time, oldest first unless reversed
    Time { reverse: bool },
}

/// A single directory of a walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkLevel {
    pub path: PathBuf,
    /// names of the subdirectories, reorder or remove entries to steer the recursion
    pub dirs: Vec<OsString>,
    pub files: Vec<OsString>,
}

impl Collector {
    pub fn load(config: &WalkConfig) -> Self {
        match config.mode {
            WalkMode::Natural => Self::Natural,
            WalkMode::Random => Self::Random,
            WalkMode::Time => Self::Time {
                reverse: config.reverse,
            },
        }
    }

    /// start a new top-down walk at `root`
    pub fn walk(&self, root: &Path) -> Walker {
        Walker {
            collector: *self,
            pending: vec![root.to_path_buf()],
            current: None,
        }
    }

    fn order(&self, level: &mut WalkLevel) {
        match self {
            Self::Natural => {}
            Self::Random => level.dirs.shuffle(&mut rand::rng()),
            Self::Time { reverse } => {
                let timed = level
                    .dirs
                    .drain(..)
                    .map(|name| (modified_time(&level.path.join(&name)), name))
                    .collect_vec();

                level.dirs = sort_by_time(timed, *reverse);
            }
        }
    }
}

/// Pre-order walker, the subdirectories of a level are only expanded once the next level is
/// requested so that changes to `WalkLevel::dirs` are honored.
#[derive(Debug)]
pub struct Walker {
    collector: Collector,
    pending: Vec<PathBuf>,
    current: Option<WalkLevel>,
}

impl Walker {
    pub fn next_level(&mut self) -> Option<Result<&mut WalkLevel, WalkError>> {
        if let Some(level) = self.current.take() {
            // reversed so the first directory ends up on top of the stack
            self.pending
                .extend(level.dirs.iter().rev().map(|name| level.path.join(name)));
        }

        let path = self.pending.pop()?;

        match list_dir(&path) {
            Ok((dirs, files)) => {
                let mut level = WalkLevel { path, dirs, files };
                self.collector.order(&mut level);

                trace!(path = ?level.path, dirs = level.dirs.len(), files = level.files.len(), "Visiting");
                Some(Ok(self.current.insert(level)))
            }
            Err(error) => Some(Err(error)),
        }
    }
}

/// list the direct children of `path` as (directories, files)
/// symlinks are not followed and end up with the files
pub(crate) fn list_dir(path: &Path) -> Result<(Vec<OsString>, Vec<OsString>), WalkError> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    for entry in WalkBuilder::new(path)
        .standard_filters(false)
        .max_depth(Some(1))
        .build()
    {
        let entry = entry.map_err(|source| WalkError {
            path: path.to_path_buf(),
            source,
        })?;

        if entry.depth() == 0 {
            continue;
        }

        let is_dir = entry.file_type().is_some_and(|kind| kind.is_dir());
        let name = entry.file_name().to_os_string();

        if is_dir {
            dirs.push(name);
        } else {
            files.push(name);
        }
    }

    Ok((dirs, files))
}

/// modification time of `path`, unreadable timestamps are treated as the epoch
pub fn modified_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .unwrap_or_else(|error| {
            debug!(path = ?path, error = ?error, "Failed to read modification time");
            UNIX_EPOCH
        })
}

/// stable sort by timestamp, equal timestamps keep their relative order in both directions
pub fn sort_by_time<T>(mut timed: Vec<(SystemTime, T)>, reverse: bool) -> Vec<T> {
    if reverse {
        timed.sort_by(|(left, _), (right, _)| right.cmp(left));
    } else {
        timed.sort_by(|(left, _), (right, _)| left.cmp(right));
    }

    timed.into_iter().map(|(_, value)| value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, fs::File, time::Duration};

    fn names(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    fn collect(collector: Collector, root: &Path) -> Vec<PathBuf> {
        let mut walker = collector.walk(root);
        let mut visited = Vec::new();

        while let Some(level) = walker.next_level() {
            visited.push(level.unwrap().path.clone());
        }

        visited
    }

    #[test]
    fn natural_walk_is_pre_order() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("a/a1")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("a/job.idf"), "").unwrap();

        let visited = collect(Collector::Natural, root);

        assert_eq!(visited.len(), 4);
        assert_eq!(visited[0], root);
        let position = |path: PathBuf| visited.iter().position(|p| *p == path).unwrap();
        assert!(position(root.join("a")) < position(root.join("a/a1")));
        // a1 follows its parent directly, siblings are not interleaved
        assert_eq!(position(root.join("a")) + 1, position(root.join("a/a1")));
    }

    #[test]
    fn files_and_dirs_are_separated() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        fs::write(temp.path().join("runit.runit"), "").unwrap();
        fs::write(temp.path().join(".hidden"), "").unwrap();

        let mut walker = Collector::Natural.walk(temp.path());
        let level = walker.next_level().unwrap().unwrap();

        assert_eq!(level.dirs, names(&["sub"]));
        assert_eq!(
            level.files.iter().cloned().sorted().collect_vec(),
            names(&[".hidden", "runit.runit"])
        );
    }

    #[test]
    fn removed_dirs_are_not_descended() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("keep/inner")).unwrap();
        fs::create_dir_all(temp.path().join("skip/inner")).unwrap();

        let mut walker = Collector::Natural.walk(temp.path());
        let mut visited = Vec::new();

        while let Some(level) = walker.next_level() {
            let level = level.unwrap();
            level.dirs.retain(|name| name != "skip");
            visited.push(level.path.clone());
        }

        assert_eq!(visited.len(), 3);
        assert!(!visited.contains(&temp.path().join("skip")));
        assert!(visited.contains(&temp.path().join("keep/inner")));
    }

    #[test]
    fn unreadable_root_yields_error() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("gone");

        let mut walker = Collector::Natural.walk(&missing);
        let error = walker.next_level().unwrap().unwrap_err();

        assert_eq!(error.path, missing);
        assert!(walker.next_level().is_none());
    }

    #[test]
    fn random_walk_changes_order_between_calls() {
        let temp = tempfile::tempdir().unwrap();
        for index in 0..8 {
            fs::create_dir(temp.path().join(format!("job-{index}"))).unwrap();
        }

        let orders: HashSet<Vec<OsString>> = (0..20)
            .map(|_| {
                let mut walker = Collector::Random.walk(temp.path());
                let level = walker.next_level().unwrap().unwrap();
                level.dirs.clone()
            })
            .collect();

        assert!(orders.len() > 1);
        for order in orders {
            assert_eq!(order.len(), 8);
            assert_eq!(order.iter().unique().count(), 8);
        }
    }

    #[test]
    fn time_sort_is_stable() {
        let at = |secs| UNIX_EPOCH + Duration::from_secs(secs);
        let timed = vec![(at(10), "a"), (at(5), "b"), (at(5), "c"), (at(20), "d")];

        assert_eq!(sort_by_time(timed.clone(), false), vec!["b", "c", "a", "d"]);
        assert_eq!(sort_by_time(timed, true), vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn missing_timestamps_are_epoch() {
        let temp = tempfile::tempdir().unwrap();

        assert_eq!(modified_time(&temp.path().join("nothing")), UNIX_EPOCH);
    }

    #[test]
    fn time_walk_orders_by_modification_time() {
        let temp = tempfile::tempdir().unwrap();
        let stamps = [("old", 100), ("new", 300), ("mid", 200)];

        for (name, secs) in stamps {
            let path = temp.path().join(name);
            fs::create_dir(&path).unwrap();
            File::open(&path)
                .unwrap()
                .set_modified(UNIX_EPOCH + Duration::from_secs(secs))
                .unwrap();
        }

        let mut walker = Collector::Time { reverse: false }.walk(temp.path());
        assert_eq!(
            walker.next_level().unwrap().unwrap().dirs,
            names(&["old", "mid", "new"])
        );

        let mut walker = Collector::Time { reverse: true }.walk(temp.path());
        assert_eq!(
            walker.next_level().unwrap().unwrap().dirs,
            names(&["new", "mid", "old"])
        );
    }

    #[test]
    fn load_respects_reverse_only_for_time() {
        let config = WalkConfig {
            mode: WalkMode::Time,
            reverse: true,
        };
        assert_eq!(Collector::load(&config), Collector::Time { reverse: true });

        let config = WalkConfig {
            mode: WalkMode::Random,
            reverse: true,
        };
        assert_eq!(Collector::load(&config), Collector::Random);
    }
}
