use once_cell::sync::Lazy;
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};
use tracing::error;

/// name of this node, used to tag claim records
pub static HOSTNAME: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => hostname.to_string_lossy().into_owned(),
    Err(error) => {
        error!(error = ?error, "Failed to retrieve hostname for claim records: {error}");

        String::from("unknown")
    }
});

/// append `suffix` to the file name of `path`, e.g. `runit.runit` -> `runit.runit.claimed`
pub fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut file_name = path.file_name().unwrap_or(OsStr::new("")).to_os_string();
    file_name.push(suffix);

    path.with_file_name(file_name)
}
