use crate::config::{ConfigError, Options, parse_options};
use crate::fuzzer::{Fuzzer, FuzzerError};
use globset::{Glob, GlobMatcher};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Shell-style pattern for a single file name. Wildcards do not match a
/// leading dot unless the pattern starts with one.
pub struct NamePattern {
    matcher: GlobMatcher,
    dotfiles: bool,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Result<Self, FuzzerError> {
        let glob = Glob::new(pattern).map_err(|e| FuzzerError::Other(format!("invalid glob {pattern:?}: {e}")))?;
        Ok(Self {
            matcher: glob.compile_matcher(),
            dotfiles: pattern.starts_with('.'),
        })
    }

    pub fn is_match(&self, name: &str) -> bool {
        (self.dotfiles || !name.starts_with('.')) && self.matcher.is_match(name)
    }
}

/// Files matching `pattern`, whose last component may be a glob. A plain
/// directory lists every file in it.
pub fn glob_files(pattern: &Path) -> Result<Vec<PathBuf>, FuzzerError> {
    if fs::metadata(pattern).is_ok_and(|m| m.is_dir()) {
        return list_files(pattern, &NamePattern::new("*")?);
    }
    match (pattern.parent(), pattern.file_name()) {
        (Some(dir), Some(name)) => {
            let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
            list_files(dir, &NamePattern::new(&name.to_string_lossy())?)
        }
        _ => Ok(Vec::new()),
    }
}

fn list_files(dir: &Path, names: &NamePattern) -> Result<Vec<PathBuf>, FuzzerError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true) {
        let entry = entry.map_err(|e| {
            let message = e.to_string();
            FuzzerError::Io(e.into_io_error().unwrap_or_else(|| std::io::Error::other(message)))
        })?;
        if entry.file_type().is_file() && names.is_match(&entry.file_name().to_string_lossy()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ListDirectoryOptions {
    /// A directory, or a path whose last component is a glob (`tests/*.txt`).
    pub pattern: PathBuf,
}

/// Yields the contents of the matching files one by one, in reverse-sorted
/// path order, then reports exhaustion.
///
/// The file set is collected at construction; every job starts over from the
/// first file, so running several instances in parallel gains nothing.
pub struct ListDirectory {
    tests: Vec<PathBuf>,
}

impl ListDirectory {
    pub fn new(pattern: &Path) -> Result<Self, FuzzerError> {
        let mut tests = glob_files(pattern)?;
        // Popped from the back, so sorting ascending yields descending order.
        tests.sort();
        debug!(count = tests.len(), pattern = %pattern.display(), "listed test files");
        Ok(Self { tests })
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let options: ListDirectoryOptions = parse_options("ListDirectory", options)?;
        Self::new(&options.pattern).map_err(|e| ConfigError::Options {
            plugin: "ListDirectory".to_string(),
            message: e.to_string(),
        })
    }
}

impl Fuzzer for ListDirectory {
    fn generate(&mut self, _index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        match self.tests.pop() {
            Some(path) => Ok(Some(fs::read(path)?)),
            None => Ok(None),
        }
    }
}
