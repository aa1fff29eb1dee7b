use crate::call::subprocess::SubprocessSettings;
use crate::config::{ConfigError, Options, parse_options};
use crate::fuzzer::{Fuzzer, FuzzerError};
use crate::process::monitor_child;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info, warn};

fn yes() -> bool {
    true
}

fn spawn_error(error: crate::call::CallError) -> FuzzerError {
    match error {
        crate::call::CallError::Spawn { command, source } => FuzzerError::Spawn { command, source },
        crate::call::CallError::Io(e) => FuzzerError::Io(e),
        other => FuzzerError::Other(other.to_string()),
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SubprocessRunnerOptions {
    /// Generator command; `{work_dir}` names the directory it must fill.
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Yield file contents (default) or file paths.
    #[serde(default = "yes")]
    pub contents: bool,
}

/// Runs an external generator once when the scope is entered, then yields
/// the files it wrote into its private directory. The directory is removed
/// when the scope ends.
pub struct SubprocessRunner {
    settings: SubprocessSettings,
    work_dir: PathBuf,
    contents: bool,
    tests: Vec<PathBuf>,
}

impl SubprocessRunner {
    pub fn new(options: SubprocessRunnerOptions, work_dir: PathBuf) -> Self {
        let dir = work_dir.to_string_lossy().into_owned();
        let expand = |s: &str| s.replace("{work_dir}", &dir);
        Self {
            settings: SubprocessSettings {
                command: expand(&options.command),
                cwd: options.cwd.as_deref().map(|c| PathBuf::from(expand(c))),
                env: options.env.iter().map(|(k, v)| (k.clone(), expand(v))).collect(),
                timeout: options.timeout,
                no_exit_code: false,
            },
            work_dir,
            contents: options.contents,
            tests: Vec::new(),
        }
    }

    pub fn from_options(options: &Options, work_dir: &Path) -> Result<Self, ConfigError> {
        let options: SubprocessRunnerOptions = parse_options("SubprocessRunner", options)?;
        Ok(Self::new(options, work_dir.join("generated")))
    }
}

impl Fuzzer for SubprocessRunner {
    fn enter(&mut self) -> Result<(), FuzzerError> {
        fs::create_dir_all(&self.work_dir)?;
        let mut child = self.settings.spawn(b"", Stdio::null()).map_err(spawn_error)?;
        let captured = monitor_child(&mut child, self.settings.timeout(), &mut |_, _| false)?;
        if captured.timed_out {
            warn!(timeout = ?self.settings.timeout, "fuzzer command timed out");
        } else if captured.exit_code != Some(0) {
            warn!(
                exit_code = ?captured.exit_code,
                stdout = %captured.stdout,
                stderr = %captured.stderr,
                "fuzzer command failed"
            );
        }

        self.tests = fs::read_dir(&self.work_dir)?
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
            .map(|e| e.path())
            .collect();
        self.tests.sort_by(|a, b| b.cmp(a));
        debug!(count = self.tests.len(), "generator produced tests");
        Ok(())
    }

    fn exit(&mut self) -> Result<(), FuzzerError> {
        self.tests.clear();
        if let Err(e) = fs::remove_dir_all(&self.work_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn generate(&mut self, _index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        let Some(path) = self.tests.pop() else {
            return Ok(None);
        };
        if self.contents {
            Ok(Some(fs::read(path)?))
        } else {
            Ok(Some(path.to_string_lossy().into_owned().into_bytes()))
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct AflRunnerOptions {
    /// Path of the `afl-fuzz` executable.
    pub afl_fuzz: String,
    /// Directory of initial test cases.
    pub input: String,
    /// Findings directory; `{uid}` is replaced by a token unique to the instance.
    pub output: String,
    /// SUT command line; `{test}` becomes AFL's `@@` placeholder.
    pub sut_command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Passed to AFL as `-t`.
    #[serde(default)]
    pub timeout: Option<String>,
    /// Passed to AFL as `-x`.
    #[serde(default)]
    pub dictionary: Option<String>,
}

/// Drives AFL in repeated passes and yields the crashing inputs it finds.
///
/// A pass lasts until AFL reports that it started fuzzing test case number
/// `iteration`; AFL is then stopped, its `crashes` directory scanned for
/// artifacts not seen before, and those are yielded in order. Later passes
/// resume from the previous findings (`-i-`).
pub struct AflRunner {
    options: AflRunnerOptions,
    output: PathBuf,
    iteration: u64,
    checked: BTreeSet<String>,
    tests: Vec<PathBuf>,
}

impl AflRunner {
    pub fn new(options: AflRunnerOptions) -> Self {
        let output = PathBuf::from(
            options
                .output
                .replace("{uid}", &crate::call::decorators::unique_token()),
        );
        Self {
            options,
            output,
            iteration: 1,
            checked: BTreeSet::new(),
            tests: Vec::new(),
        }
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        Ok(Self::new(parse_options("AFLRunner", options)?))
    }

    /// The AFL command line of the current pass.
    pub fn command(&self) -> String {
        let input = if self.iteration == 1 {
            format!("-i {}", self.options.input)
        } else {
            "-i-".to_string()
        };
        let mut command = format!("{} {input} -o {}", self.options.afl_fuzz, self.output.display());
        if let Some(t) = &self.options.timeout {
            command.push_str(&format!(" -t {t}"));
        }
        if let Some(x) = &self.options.dictionary {
            command.push_str(&format!(" -x {x}"));
        }
        command.push(' ');
        command.push_str(&self.options.sut_command.replace("{test}", "@@"));
        command
    }

    fn run_pass(&mut self) -> Result<bool, FuzzerError> {
        let mut env = self.options.env.clone();
        env.insert("AFL_NO_UI".to_string(), "1".to_string());
        let settings = SubprocessSettings {
            command: self.command(),
            cwd: self.options.cwd.clone(),
            env,
            timeout: None,
            no_exit_code: false,
        };
        let mark = format!("Fuzzing test case #{}", self.iteration);
        info!(iteration = self.iteration, "starting AFL pass");
        let mut child = settings.spawn(b"", Stdio::null()).map_err(spawn_error)?;
        let captured = monitor_child(&mut child, None, &mut |_, line| line.contains(&mark))?;
        self.iteration += 1;
        Ok(captured.stopped)
    }

    fn collect_crashes(&mut self) -> Result<(), FuzzerError> {
        let crash_dir = self.output.join("crashes");
        let Ok(entries) = fs::read_dir(&crash_dir) else {
            return Ok(());
        };
        let mut fresh: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| n.starts_with("id") && !self.checked.contains(n.as_ref()))
            })
            .collect();
        fresh.sort_by(|a, b| b.cmp(a));
        self.tests = fresh;
        Ok(())
    }
}

impl Fuzzer for AflRunner {
    fn enter(&mut self) -> Result<(), FuzzerError> {
        fs::create_dir_all(&self.output)?;
        Ok(())
    }

    fn generate(&mut self, _index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        loop {
            if let Some(path) = self.tests.pop() {
                if let Some(name) = path.file_name() {
                    self.checked.insert(name.to_string_lossy().into_owned());
                }
                return Ok(Some(fs::read(path)?));
            }
            let reached_mark = self.run_pass()?;
            self.collect_crashes()?;
            if self.tests.is_empty() && !reached_mark {
                warn!("AFL stopped before reaching the next test case");
                return Ok(None);
            }
        }
    }
}
