use crate::call::filters::string_list;
use crate::call::subprocess::SubprocessSettings;
use crate::call::{Call, CallDecorator, CallError, CallInput};
use crate::config::{ConfigError, Options, parse_options};
use crate::issue::{ID, Issue, Outcome, TEST, Value};
use crate::process::monitor_child;
use serde::Deserialize;
use std::ffi::CStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, warn};

/// Random hex token for `{uid}` placeholders in file names.
pub fn unique_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileWriterOptions {
    /// File name pattern; `{uid}` is replaced by a fresh token per test.
    pub filename: String,
}

/// Hands the SUT a file path instead of the test content.
///
/// The test is written below the job's working directory, the path becomes
/// the input of the wrapped call, and the file is removed as soon as the call
/// returns. Issues get a `filename` field with the file's base name.
pub struct FileWriterDecorator {
    dir: PathBuf,
    filename: String,
    written: Vec<PathBuf>,
}

impl FileWriterDecorator {
    pub fn new(dir: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            filename: filename.into(),
            written: Vec::new(),
        }
    }

    pub fn from_options(options: &Options, work_dir: &Path) -> Result<Self, ConfigError> {
        let options: FileWriterOptions = parse_options("FileWriterDecorator", options)?;
        Ok(Self::new(work_dir, options.filename))
    }

    fn remove(path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove test file");
            }
        }
    }
}

impl CallDecorator for FileWriterDecorator {
    fn exit(&mut self, inner: &mut dyn Call) -> Result<(), CallError> {
        for path in self.written.drain(..) {
            Self::remove(&path);
        }
        inner.exit()
    }

    fn call(&mut self, inner: &mut dyn Call, mut input: CallInput) -> Result<Outcome, CallError> {
        let path = self.dir.join(self.filename.replace("{uid}", &unique_token()));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &input.test)?;
        self.written.push(path.clone());

        input.test = path.to_string_lossy().into_owned().into_bytes();
        let result = inner.call(input);

        Self::remove(&path);
        self.written.retain(|p| p != &path);

        let mut outcome = result?;
        if let Outcome::Issue(issue) = &mut outcome {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            issue.insert("filename", name);
        }
        Ok(outcome)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FileReaderOptions {
    #[serde(default)]
    pub cleanup: bool,
}

/// For SUTs that receive a path: stores the file's content as the issue's
/// `test` and optionally deletes the file afterwards.
#[derive(Default)]
pub struct FileReaderDecorator {
    cleanup: bool,
}

impl FileReaderDecorator {
    pub fn new(cleanup: bool) -> Self {
        Self { cleanup }
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let options: FileReaderOptions = parse_options("FileReaderDecorator", options)?;
        Ok(Self::new(options.cleanup))
    }
}

impl CallDecorator for FileReaderDecorator {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        let path = PathBuf::from(String::from_utf8_lossy(&input.test).into_owned());
        let mut outcome = inner.call(input)?;
        if let Outcome::Issue(issue) = &mut outcome {
            match fs::read(&path) {
                Ok(content) => {
                    issue.insert(TEST, content);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot read test file"),
            }
        }
        if self.cleanup {
            let _ = fs::remove_file(&path);
        }
        Ok(outcome)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct AnonymizeOptions {
    pub old: String,
    #[serde(default)]
    pub new: String,
    /// Fields to rewrite; every textual field when omitted.
    #[serde(default)]
    pub properties: Option<toml::Value>,
}

/// Replaces a literal substring in the textual fields of an issue.
pub struct AnonymizeDecorator {
    old: String,
    new: String,
    properties: Option<Vec<String>>,
}

impl AnonymizeDecorator {
    pub fn new(old: impl Into<String>, new: impl Into<String>, properties: Option<Vec<String>>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
            properties,
        }
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let options: AnonymizeOptions = parse_options("AnonymizeDecorator", options)?;
        let properties = options
            .properties
            .as_ref()
            .map(|p| string_list("AnonymizeDecorator", "properties", p))
            .transpose()?;
        Ok(Self::new(options.old, options.new, properties))
    }

    fn anonymize(&self, issue: &mut Issue) {
        if self.old.is_empty() {
            return;
        }
        let keys: Vec<String> = match &self.properties {
            Some(properties) => properties.clone(),
            None => issue.keys().map(str::to_string).collect(),
        };
        for key in keys {
            let replaced = match issue.get(&key) {
                Some(Value::Text(text)) if text.contains(&self.old) => {
                    Value::Text(text.replace(&self.old, &self.new))
                }
                Some(Value::Bytes(bytes)) => {
                    let text = String::from_utf8_lossy(bytes);
                    if !text.contains(&self.old) {
                        continue;
                    }
                    Value::Bytes(text.replace(&self.old, &self.new).into_bytes())
                }
                _ => continue,
            };
            issue.insert(&key, replaced);
        }
    }
}

impl CallDecorator for AnonymizeDecorator {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        let mut outcome = inner.call(input)?;
        if let Outcome::Issue(issue) = &mut outcome {
            self.anonymize(issue);
        }
        Ok(outcome)
    }
}

/// Builds `id` from the values of a list of fields, joined by spaces.
pub struct UniqueIdDecorator {
    properties: Vec<String>,
}

impl UniqueIdDecorator {
    pub fn new(properties: Vec<String>) -> Self {
        Self { properties }
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let value = options.get("properties").ok_or_else(|| ConfigError::Options {
            plugin: "UniqueIdDecorator".to_string(),
            message: "missing 'properties'".to_string(),
        })?;
        Ok(Self::new(string_list("UniqueIdDecorator", "properties", value)?))
    }
}

impl CallDecorator for UniqueIdDecorator {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        let mut outcome = inner.call(input)?;
        if let Outcome::Issue(issue) = &mut outcome {
            let parts: Vec<String> = self
                .properties
                .iter()
                .filter_map(|p| issue.text(p).map(|t| t.into_owned()))
                .filter(|t| !t.is_empty())
                .collect();
            if !parts.is_empty() {
                issue.insert(ID, parts.join(" "));
            }
        }
        Ok(outcome)
    }
}

fn field(raw: &[libc::c_char]) -> String {
    // SAFETY: utsname fields are NUL terminated within their fixed-size buffers.
    unsafe { CStr::from_ptr(raw.as_ptr()) }.to_string_lossy().into_owned()
}

/// `(platform, node)` as reported by `uname(2)`.
pub fn platform_info() -> (String, String) {
    // SAFETY: utsname is plain old data, zero-initialisation is a valid state.
    let mut name: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: `name` is a valid, writable utsname.
    if unsafe { libc::uname(&mut name) } != 0 {
        return (
            format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            String::new(),
        );
    }
    let platform = format!(
        "{}-{}-{}",
        field(&name.sysname),
        field(&name.release),
        field(&name.machine)
    );
    (platform, field(&name.nodename))
}

/// Attaches `platform` and `node` to issues.
#[derive(Default)]
pub struct PlatformInfoDecorator;

impl CallDecorator for PlatformInfoDecorator {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        let mut outcome = inner.call(input)?;
        if let Outcome::Issue(issue) = &mut outcome {
            let (platform, node) = platform_info();
            issue.insert("platform", platform);
            issue.insert("node", node);
        }
        Ok(outcome)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SubprocessPropertyOptions {
    pub property: String,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Runs a secondary command when an issue is found and stores its trimmed
/// stdout in the `property` field (e.g. the SUT's version string).
pub struct SubprocessPropertyDecorator {
    property: String,
    settings: SubprocessSettings,
}

impl SubprocessPropertyDecorator {
    pub fn new(property: impl Into<String>, settings: SubprocessSettings) -> Self {
        Self {
            property: property.into(),
            settings,
        }
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let options: SubprocessPropertyOptions = parse_options("SubprocessPropertyDecorator", options)?;
        let settings = SubprocessSettings {
            command: options.command,
            cwd: options.cwd,
            env: options.env,
            timeout: options.timeout,
            no_exit_code: false,
        };
        Ok(Self::new(options.property, settings))
    }

    fn query(&self, test: &[u8]) -> Result<Option<String>, CallError> {
        let mut child = self.settings.spawn(test, Stdio::null())?;
        let captured = monitor_child(&mut child, self.settings.timeout(), &mut |_, _| false)?;
        if captured.timed_out || captured.exit_code != Some(0) {
            debug!(property = %self.property, exit_code = ?captured.exit_code, "property command failed");
            return Ok(None);
        }
        Ok(Some(captured.stdout.trim().to_string()))
    }
}

impl CallDecorator for SubprocessPropertyDecorator {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        let test = input.test.clone();
        let mut outcome = inner.call(input)?;
        if let Outcome::Issue(issue) = &mut outcome {
            if let Some(value) = self.query(&test)? {
                issue.insert(&self.property, value);
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::subprocess::sh_settings;
    use crate::call::{FnCall, decorate};
    use crate::issue::STDERR;
    use std::sync::{Arc, Mutex};

    fn issue_call(issue: Issue) -> Box<dyn Call> {
        Box::new(FnCall(move |_input: CallInput| Ok(Outcome::Issue(issue.clone()))))
    }

    #[test]
    fn test_file_writer_passes_path_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let seen: Arc<Mutex<Option<(PathBuf, Vec<u8>)>>> = Arc::default();
        let recorder = seen.clone();
        let base = FnCall(move |input: CallInput| {
            let path = PathBuf::from(String::from_utf8(input.test).unwrap());
            let content = fs::read(&path).unwrap();
            *recorder.lock().unwrap() = Some((path, content));
            Ok(Outcome::Issue(Issue::new()))
        });
        let mut call = decorate(
            Box::new(base),
            vec![Box::new(FileWriterDecorator::new(dir.path(), "t-{uid}.html"))],
        );
        let outcome = call.call(CallInput::new(b"<html>".to_vec())).unwrap();

        let (path, content) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(content, b"<html>");
        assert!(path.starts_with(dir.path()));
        assert!(!path.exists(), "Test file must be removed after the call");
        let filename = outcome.fields().and_then(|f| f.text("filename")).unwrap().into_owned();
        assert!(filename.starts_with("t-") && filename.ends_with(".html"));
        assert!(!filename.contains("{uid}"));
    }

    #[test]
    fn test_file_reader_loads_test_into_issue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.bin");
        fs::write(&path, b"\x00crash").unwrap();
        let mut call = decorate(
            issue_call(Issue::new()),
            vec![Box::new(FileReaderDecorator::new(true))],
        );
        let outcome = call
            .call(CallInput::new(path.to_string_lossy().as_bytes().to_vec()))
            .unwrap();
        assert_eq!(
            outcome.fields().and_then(|f| f.test()).as_deref(),
            Some(&b"\x00crash"[..])
        );
        assert!(!path.exists(), "cleanup = true removes the file");
    }

    #[test]
    fn test_anonymize_selected_and_all_fields() {
        let issue = Issue::new()
            .with(STDERR, "/home/alice/sut crashed")
            .with("cmd", "/home/alice/sut --x");
        let mut selected = decorate(
            issue_call(issue.clone()),
            vec![Box::new(AnonymizeDecorator::new(
                "/home/alice",
                "~",
                Some(vec![STDERR.to_string()]),
            ))],
        );
        let out = selected.call(CallInput::default()).unwrap();
        let fields = out.fields().unwrap();
        assert_eq!(fields.text(STDERR).as_deref(), Some("~/sut crashed"));
        assert_eq!(fields.text("cmd").as_deref(), Some("/home/alice/sut --x"));

        let mut all = decorate(
            issue_call(issue),
            vec![Box::new(AnonymizeDecorator::new("/home/alice", "", None))],
        );
        let out = all.call(CallInput::default()).unwrap();
        assert_eq!(out.fields().and_then(|f| f.text("cmd")).as_deref(), Some("/sut --x"));
    }

    #[test]
    fn test_unique_id_joins_present_properties() {
        let issue = Issue::new().with("error_type", "SEGV").with("function", "parse");
        let mut call = decorate(
            issue_call(issue),
            vec![Box::new(UniqueIdDecorator::new(vec![
                "error_type".into(),
                "missing".into(),
                "function".into(),
            ]))],
        );
        let out = call.call(CallInput::default()).unwrap();
        assert_eq!(out.fields().and_then(|f| f.id()).as_deref(), Some("SEGV parse"));
    }

    #[test]
    fn test_platform_info_fields() {
        let mut call = decorate(issue_call(Issue::new()), vec![Box::new(PlatformInfoDecorator)]);
        let out = call.call(CallInput::default()).unwrap();
        let platform = out.fields().and_then(|f| f.text("platform")).unwrap().into_owned();
        assert!(!platform.is_empty());
        assert!(out.fields().unwrap().contains("node"));
    }

    #[test]
    fn test_subprocess_property_only_on_issues() {
        let decorator = SubprocessPropertyDecorator::new("version", sh_settings("echo \"  1.2.3 \""));
        let mut call = decorate(issue_call(Issue::new()), vec![Box::new(decorator)]);
        let out = call.call(CallInput::default()).unwrap();
        assert_eq!(out.fields().and_then(|f| f.text("version")).as_deref(), Some("1.2.3"));

        let decorator = SubprocessPropertyDecorator::new("version", sh_settings("echo 1"));
        let mut quiet = decorate(
            Box::new(FnCall(|_input: CallInput| Ok(Outcome::NonIssue(Issue::new())))),
            vec![Box::new(decorator)],
        );
        let out = quiet.call(CallInput::default()).unwrap();
        assert!(!out.fields().unwrap().contains("version"));
    }

    #[test]
    fn test_options_parsing() {
        let options: Options = toml::from_str("properties = \"error_type\"").unwrap();
        assert!(UniqueIdDecorator::from_options(&options).is_ok());
        assert!(UniqueIdDecorator::from_options(&Options::new()).is_err());

        let options: Options = toml::from_str("property = \"v\"\ncommand = \"true\"").unwrap();
        assert!(SubprocessPropertyDecorator::from_options(&options).is_ok());
    }
}
