use crate::call::decorators::unique_token;
use crate::config::{ConfigError, Options, parse_options};
use crate::fuzzer::{Fuzzer, FuzzerDecorator, FuzzerError, SharedFuzzer};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FuzzerFileWriterOptions {
    /// File name pattern, `{uid}` is replaced once per fuzzer instance.
    pub filename: String,
}

/// Writes every generated test to a file and returns the file's path instead;
/// the content stays available through [`Fuzzer::test`]. The file is removed
/// when the fuzzer's scope ends.
pub struct FuzzerFileWriterDecorator {
    path: PathBuf,
    last: Option<Vec<u8>>,
}

impl FuzzerFileWriterDecorator {
    pub fn new(dir: &Path, filename: &str) -> Self {
        Self {
            path: dir.join(filename.replace("{uid}", &unique_token())),
            last: None,
        }
    }

    pub fn from_options(options: &Options, work_dir: &Path) -> Result<Self, ConfigError> {
        let options: FuzzerFileWriterOptions = parse_options("FileWriterDecorator", options)?;
        Ok(Self::new(work_dir, &options.filename))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FuzzerDecorator for FuzzerFileWriterDecorator {
    fn enter(&mut self, inner: &mut SharedFuzzer) -> Result<(), FuzzerError> {
        inner.enter()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn exit(&mut self, inner: &mut SharedFuzzer) -> Result<(), FuzzerError> {
        let result = inner.exit();
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove test file");
            }
        }
        result
    }

    fn generate(&mut self, inner: &mut SharedFuzzer, index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        self.last = inner.generate(index)?;
        let Some(test) = &self.last else {
            return Ok(None);
        };
        fs::write(&self.path, test)?;
        Ok(Some(self.path.to_string_lossy().into_owned().into_bytes()))
    }

    fn test(&self, _inner: &SharedFuzzer) -> Option<Vec<u8>> {
        self.last.clone()
    }

    fn provides_test(&self, _inner: &SharedFuzzer) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzer::{FnFuzzer, decorate_fuzzer};

    #[test]
    fn test_returns_path_and_keeps_content_as_test() {
        let dir = tempfile::tempdir().unwrap();
        let decorator = FuzzerFileWriterDecorator::new(&dir.path().join("out"), "t-{uid}.txt");
        let path = decorator.path().to_path_buf();
        let mut fuzzer = decorate_fuzzer(
            Box::new(FnFuzzer(|i| (i < 1).then(|| b"content".to_vec()))),
            vec![Box::new(decorator)],
        );
        fuzzer.enter().unwrap();
        let returned = fuzzer.generate(0).unwrap().unwrap();
        assert_eq!(PathBuf::from(String::from_utf8(returned).unwrap()), path);
        assert_eq!(fs::read(&path).unwrap(), b"content");
        assert_eq!(fuzzer.test(), Some(b"content".to_vec()));

        assert_eq!(fuzzer.generate(1).unwrap(), None);
        fuzzer.exit().unwrap();
        assert!(!path.exists(), "File removed on scope exit");
    }
}
