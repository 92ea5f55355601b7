use crate::collector::{list_dir, WalkError};
use ignore::WalkBuilder;
use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Failed to walk the job tree")]
    Walk(#[from] ignore::Error),
    #[error(transparent)]
    List(#[from] WalkError),
    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StagingError + '_ {
    move |source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Local copy of a job folder, removed again on drop
#[derive(Debug)]
pub struct StagingCopy {
    path: PathBuf,
}

impl StagingCopy {
    /// copy `source` to `path`, replacing whatever was left at `path` by an earlier attempt
    pub fn create(path: PathBuf, source: &Path) -> Result<Self, StagingError> {
        match fs::symlink_metadata(&path) {
            Ok(metadata) => {
                warn!(path = ?path, "Removing stale staging copy");

                if metadata.is_dir() {
                    fs::remove_dir_all(&path).map_err(io_error(&path))?;
                } else {
                    fs::remove_file(&path).map_err(io_error(&path))?;
                }
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(io_error(&path)(error)),
        }

        // the guard exists before the copy starts so a partial copy is cleaned up as well
        let staging = Self { path };
        let copied = copy_tree(source, &staging.path)?;
        debug!(path = ?staging.path, files = copied, "Staged job");

        Ok(staging)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingCopy {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Removed staging copy"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!(path = ?self.path, error = ?error, "Failed to remove staging copy"),
        }
    }
}

/// recursively copy `source` into `target`, returns the number of copied files
pub fn copy_tree(source: &Path, target: &Path) -> Result<usize, StagingError> {
    let mut copied = 0;

    for entry in WalkBuilder::new(source)
        .standard_filters(false)
        .follow_links(true)
        .build()
    {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let destination = target.join(relative);

        if entry.file_type().is_some_and(|kind| kind.is_dir()) {
            fs::create_dir_all(&destination).map_err(io_error(&destination))?;
        } else {
            fs::copy(entry.path(), &destination).map_err(io_error(&destination))?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Copy every top level entry of `staging` whose name doesn't exist in `original` yet.
/// Existing entries are never touched, returns the names of the merged entries.
pub fn merge_back(staging: &Path, original: &Path) -> Result<Vec<OsString>, StagingError> {
    let (dirs, files) = list_dir(staging)?;
    let mut merged = Vec::new();

    for name in dirs {
        let destination = original.join(&name);

        if fs::symlink_metadata(&destination).is_ok() {
            trace!(path = ?destination, "Keeping existing directory");
            continue;
        }

        copy_tree(&staging.join(&name), &destination)?;
        merged.push(name);
    }

    for name in files {
        if copy_new(&staging.join(&name), &original.join(&name))? {
            merged.push(name);
        }
    }

    Ok(merged)
}

/// copy a single file unless `destination` already exists, checked and created in one step
fn copy_new(source: &Path, destination: &Path) -> Result<bool, StagingError> {
    let mut target = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
    {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::AlreadyExists => {
            trace!(path = ?destination, "Keeping existing file");
            return Ok(false);
        }
        Err(error) => return Err(io_error(destination)(error)),
    };

    let copied = File::open(source)
        .map_err(io_error(source))
        .and_then(|mut input| {
            io::copy(&mut input, &mut target).map_err(io_error(destination))?;
            Ok(input)
        });

    // a truncated output would never be replaced by a later merge
    let input = match copied {
        Ok(input) => input,
        Err(error) => {
            if let Err(remove) = fs::remove_file(destination) {
                warn!(path = ?destination, error = ?remove, "Failed to remove partial copy");
            }
            return Err(error);
        }
    };

    if let Err(error) = input
        .metadata()
        .and_then(|metadata| target.set_permissions(metadata.permissions()))
    {
        debug!(path = ?destination, error = ?error, "Failed to copy permissions");
    }

    Ok(true)
}
