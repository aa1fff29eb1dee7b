use crate::call::{Call, CallError, CallInput};
use crate::config::{Options, parse_options};
use crate::issue::{EXIT_CODE, Issue, Outcome, STDERR, STDOUT, TIME};
use crate::process::{Captured, monitor_child, split_command};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

/// Launch settings shared by every subprocess based call.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SubprocessSettings {
    /// Command line; `{test}` is replaced by the test before splitting.
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Variables added to the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Report every execution as an issue regardless of the exit code.
    #[serde(default)]
    pub no_exit_code: bool,
}

impl SubprocessSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .filter(|t| *t > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// The argument vector for `test`.
    pub fn argv(&self, test: &[u8]) -> Result<Vec<String>, CallError> {
        let command = self.command.replace("{test}", &String::from_utf8_lossy(test));
        let argv = split_command(&command).map_err(CallError::Other)?;
        if argv.is_empty() {
            return Err(CallError::Other(format!("Empty command: '{}'", self.command)));
        }
        Ok(argv)
    }

    pub fn command(&self, argv: &[String]) -> Command {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.env);
        cmd
    }

    /// Spawns the command with piped output streams and `stdin` as given.
    pub fn spawn(&self, test: &[u8], stdin: Stdio) -> Result<Child, CallError> {
        let argv = self.argv(test)?;
        debug!(command = ?argv, "spawning SUT");
        self.command(&argv)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CallError::Spawn {
                command: argv.join(" "),
                source,
            })
    }
}

/// The process details every subprocess call reports.
pub fn process_details(captured: &Captured) -> Issue {
    Issue::new()
        .with(EXIT_CODE, captured.exit_code.map(i64::from).unwrap_or(-1))
        .with(STDOUT, captured.stdout.clone())
        .with(STDERR, captured.stderr.clone())
        .with(TIME, captured.elapsed.as_secs_f64())
}

fn classify(settings: &SubprocessSettings, captured: &Captured) -> Outcome {
    let details = process_details(captured);
    if captured.timed_out {
        debug!("SUT timed out");
        return Outcome::NonIssue(details);
    }
    let failed = captured.exit_code.is_some_and(|c| c != 0);
    Outcome::from_fields(details, settings.no_exit_code || failed)
}

fn feed_stdin(child: &mut Child, test: &[u8]) {
    if let Some(mut stdin) = child.stdin.take() {
        let data = test.to_vec();
        // A separate writer keeps large inputs from deadlocking against full output pipes.
        std::thread::spawn(move || {
            if let Err(e) = stdin.write_all(&data) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    warn!(error = %e, "failed to write test to SUT stdin");
                }
            }
        });
    }
}

/// Runs a command with the test substituted into its arguments.
///
/// Reports `exit_code`, `stdout`, `stderr` and `time`; the result is an issue
/// when the exit code is non-zero (or always, with `no_exit_code`).
pub struct SubprocessCall {
    settings: SubprocessSettings,
}

impl SubprocessCall {
    pub fn new(settings: SubprocessSettings) -> Self {
        Self { settings }
    }

    pub fn from_options(options: &Options) -> Result<Self, crate::config::ConfigError> {
        Ok(Self::new(parse_options("SubprocessCall", options)?))
    }
}

impl Call for SubprocessCall {
    fn call(&mut self, input: CallInput) -> Result<Outcome, CallError> {
        let timeout = input.timeout.or_else(|| self.settings.timeout());
        let mut child = self.settings.spawn(&input.test, Stdio::null())?;
        let captured = monitor_child(&mut child, timeout, &mut |_, _| false)?;
        Ok(classify(&self.settings, &captured))
    }
}

/// Like [`SubprocessCall`], but the test is written to the SUT's stdin.
pub struct StdinSubprocessCall {
    settings: SubprocessSettings,
}

impl StdinSubprocessCall {
    pub fn new(settings: SubprocessSettings) -> Self {
        Self { settings }
    }

    pub fn from_options(options: &Options) -> Result<Self, crate::config::ConfigError> {
        Ok(Self::new(parse_options("StdinSubprocessCall", options)?))
    }
}

impl Call for StdinSubprocessCall {
    fn call(&mut self, input: CallInput) -> Result<Outcome, CallError> {
        let timeout = input.timeout.or_else(|| self.settings.timeout());
        // The command line never carries the test here.
        let mut child = self.settings.spawn(b"", Stdio::piped())?;
        feed_stdin(&mut child, &input.test);
        let captured = monitor_child(&mut child, timeout, &mut |_, _| false)?;
        Ok(classify(&self.settings, &captured))
    }
}

#[cfg(test)]
pub(crate) fn sh_settings(script: &str) -> SubprocessSettings {
    SubprocessSettings {
        command: format!("sh -c '{}'", script.replace('\'', r"'\''")),
        cwd: None,
        env: BTreeMap::new(),
        timeout: Some(10.0),
        no_exit_code: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::Value;
    use std::time::Instant;

    #[test]
    fn test_nonzero_exit_is_an_issue_with_process_details() {
        let mut call = SubprocessCall::new(sh_settings("echo out; echo err >&2; exit 7"));
        let outcome = call.call(CallInput::new(b"ignored".to_vec())).unwrap();
        let Outcome::Issue(issue) = outcome else {
            panic!("Expected an issue, got {outcome:?}");
        };
        assert_eq!(issue.get(EXIT_CODE), Some(&Value::Int(7)));
        assert_eq!(issue.text(STDOUT).as_deref(), Some("out\n"));
        assert_eq!(issue.text(STDERR).as_deref(), Some("err\n"));
        assert!(issue.get(TIME).and_then(Value::as_f64).is_some());
    }

    #[test]
    fn test_zero_exit_is_a_non_issue_unless_no_exit_code() {
        let mut call = SubprocessCall::new(sh_settings("exit 0"));
        let outcome = call.call(CallInput::new(Vec::new())).unwrap();
        assert!(matches!(outcome, Outcome::NonIssue(_)));

        let mut settings = sh_settings("exit 0");
        settings.no_exit_code = true;
        let outcome = SubprocessCall::new(settings).call(CallInput::new(Vec::new())).unwrap();
        assert!(outcome.is_issue());
    }

    #[test]
    fn test_test_is_substituted_into_the_command() {
        let mut call = SubprocessCall::new(SubprocessSettings {
            command: "echo {test}".to_string(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
            no_exit_code: true,
        });
        let outcome = call.call(CallInput::new(b"hello".to_vec())).unwrap();
        assert_eq!(
            outcome.fields().and_then(|f| f.text(STDOUT)).as_deref(),
            Some("hello\n")
        );
    }

    #[test]
    fn test_stdin_variant_feeds_the_test() {
        let mut call = StdinSubprocessCall::new(sh_settings("grep -q BOOM && exit 3; exit 0"));
        let boom = call.call(CallInput::new(b"xxBOOMxx\n".to_vec())).unwrap();
        assert!(boom.is_issue());
        let calm = call.call(CallInput::new(b"calm\n".to_vec())).unwrap();
        assert!(!calm.is_issue());
    }

    #[test]
    fn test_timeout_yields_non_issue_and_kills_child() {
        let mut settings = sh_settings("echo partial; sleep 3600");
        settings.timeout = Some(0.5);
        let start = Instant::now();
        let outcome = SubprocessCall::new(settings).call(CallInput::new(Vec::new())).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        let Outcome::NonIssue(details) = outcome else {
            panic!("Timeout must not be reported as an issue, got {outcome:?}");
        };
        assert_eq!(details.text(STDOUT).as_deref(), Some("partial\n"));
    }

    #[test]
    fn test_env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sh_settings("echo $STAMPEDE_X; pwd");
        settings.env.insert("STAMPEDE_X".into(), "42".into());
        settings.cwd = Some(dir.path().to_path_buf());
        settings.no_exit_code = true;
        let outcome = SubprocessCall::new(settings).call(CallInput::new(Vec::new())).unwrap();
        let stdout = outcome.fields().and_then(|f| f.text(STDOUT)).unwrap().into_owned();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(stdout.starts_with("42\n"));
        assert!(stdout.contains(canonical.to_str().unwrap()) || stdout.contains(dir.path().to_str().unwrap()));
    }

    #[test]
    fn test_missing_binary_is_a_spawn_error() {
        let mut call = SubprocessCall::new(SubprocessSettings {
            command: "/nonexistent/stampede-sut".into(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
            no_exit_code: false,
        });
        assert!(matches!(
            call.call(CallInput::new(Vec::new())),
            Err(CallError::Spawn { .. })
        ));
    }
}
