use crate::call::subprocess::SubprocessSettings;
use crate::call::{Call, CallError, CallInput};
use crate::config::{ConfigError, Options, parse_options};
use crate::issue::{EXIT_CODE, Issue, Outcome, STDERR, STDOUT, Value};
use crate::process::{POLL_INTERVAL, Stream, StreamMonitor, exit_code, kill_process_tree};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestRunnerOptions {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Any of these appearing in stdout or stderr ends a test.
    #[serde(default)]
    pub end_texts: Vec<String>,
    /// Wait for an end text right after starting the runner.
    #[serde(default)]
    pub init_wait: bool,
    /// Upper bound in seconds on waiting for a single test.
    #[serde(default)]
    pub timeout: Option<f64>,
}

struct Runner {
    child: Child,
    stdin: ChildStdin,
    monitor: StreamMonitor,
}

impl Runner {
    fn kill(mut self) {
        kill_process_tree(self.child.id(), true);
        let _ = self.child.wait();
    }
}

/// Drives a long-lived test runner: each test is written as one line to the
/// runner's stdin, and the call lasts until an end text shows up in its
/// output or the runner exits.
///
/// Every completed exchange is reported as an issue with `exit_code` (null
/// while the runner is alive), `stdout` and `stderr`, leaving the decision to
/// the filters stacked on top. A failed write yields a non-issue and the
/// runner is restarted on the next call.
pub struct TestRunnerSubprocessCall {
    options: TestRunnerOptions,
    runner: Option<Runner>,
}

impl TestRunnerSubprocessCall {
    pub fn new(options: TestRunnerOptions) -> Self {
        Self {
            options,
            runner: None,
        }
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        Ok(Self::new(parse_options("TestRunnerSubprocessCall", options)?))
    }

    fn timeout(&self) -> Option<Duration> {
        self.options
            .timeout
            .filter(|t| *t > 0.0)
            .map(Duration::from_secs_f64)
    }

    fn start(&mut self) -> Result<(), CallError> {
        let settings = SubprocessSettings {
            command: self.options.command.clone(),
            cwd: self.options.cwd.clone(),
            env: self.options.env.clone(),
            timeout: None,
            no_exit_code: false,
        };
        let argv = settings.argv(b"")?;
        debug!(command = ?argv, "starting test runner");
        let mut child = settings
            .command(&argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CallError::Spawn {
                command: argv.join(" "),
                source,
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CallError::Other("Test runner has no stdin".to_string()))?;
        let monitor = StreamMonitor::new(child.stdout.take(), child.stderr.take())?;
        let mut runner = Runner {
            child,
            stdin,
            monitor,
        };
        if self.options.init_wait {
            wait_til_end(&mut runner, &self.options.end_texts, self.timeout())?;
        }
        self.runner = Some(runner);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(runner) = self.runner.take() {
            runner.kill();
        }
    }
}

/// Returns `true` when an end text was seen, `false` on exit or timeout.
fn wait_til_end(runner: &mut Runner, end_texts: &[String], timeout: Option<Duration>) -> Result<bool, CallError> {
    let start = Instant::now();
    loop {
        runner.monitor.poll(POLL_INTERVAL, &mut |_, _| false)?;
        let stdout = runner.monitor.output(Stream::Stdout);
        let stderr = runner.monitor.output(Stream::Stderr);
        if end_texts
            .iter()
            .any(|t| stdout.contains(t.as_str()) || stderr.contains(t.as_str()))
        {
            return Ok(true);
        }
        if runner.child.try_wait()?.is_some() {
            runner.monitor.read_available(&mut |_, _| false)?;
            return Ok(false);
        }
        if timeout.is_some_and(|t| start.elapsed() >= t) {
            return Ok(false);
        }
    }
}

impl Call for TestRunnerSubprocessCall {
    fn enter(&mut self) -> Result<(), CallError> {
        if self.runner.is_none() {
            self.start()?;
        }
        Ok(())
    }

    fn exit(&mut self) -> Result<(), CallError> {
        self.stop();
        Ok(())
    }

    fn call(&mut self, input: CallInput) -> Result<Outcome, CallError> {
        let dead = match self.runner.as_mut() {
            Some(runner) => runner.child.try_wait()?.is_some(),
            None => true,
        };
        if dead {
            self.stop();
            self.start()?;
        }
        let timeout = input.timeout.or_else(|| self.timeout());
        let end_texts = self.options.end_texts.clone();
        let Some(runner) = self.runner.as_mut() else {
            return Ok(Outcome::Empty);
        };

        runner.monitor.reset();
        let mut line = input.test;
        line.push(b'\n');
        if let Err(e) = runner.stdin.write_all(&line).and_then(|()| runner.stdin.flush()) {
            warn!(error = %e, "failed to send test to runner, restarting it on next call");
            self.stop();
            return Ok(Outcome::NonIssue(Issue::new()));
        }

        let ended = wait_til_end(runner, &end_texts, timeout)?;
        let status = runner.child.try_wait()?;
        let mut issue = Issue::new()
            .with(STDOUT, runner.monitor.output(Stream::Stdout))
            .with(STDERR, runner.monitor.output(Stream::Stderr));
        issue.insert(
            EXIT_CODE,
            status.map_or(Value::Null, |s| Value::Int(i64::from(exit_code(&s)))),
        );

        if !ended && status.is_none() {
            debug!("test runner timed out");
            self.stop();
            return Ok(Outcome::NonIssue(issue));
        }
        Ok(Outcome::Issue(issue))
    }
}

impl Drop for TestRunnerSubprocessCall {
    fn drop(&mut self) {
        self.stop();
    }
}
