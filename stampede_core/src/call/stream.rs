use crate::automaton::RegexAutomaton;
use crate::call::subprocess::{SubprocessSettings, process_details};
use crate::call::{Call, CallError, CallInput};
use crate::config::{ConfigError, Options, parse_options};
use crate::issue::{Issue, Outcome};
use crate::process::monitor_child;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::debug;

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct StreamMonitoredOptions {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Automaton instructions run over every output line.
    #[serde(default)]
    pub end_patterns: Vec<String>,
}

/// Runs the SUT while watching its output line by line.
///
/// Each completed line of stdout and stderr is fed to a regex automaton built
/// from `end_patterns`. As soon as the automaton terminates or records new
/// fields, the SUT's process tree is killed. The outcome is an issue made of
/// the recorded fields plus the process details, or a non-issue carrying only
/// the process details when nothing matched.
pub struct StreamMonitoredSubprocessCall {
    settings: SubprocessSettings,
    automaton: RegexAutomaton,
}

impl StreamMonitoredSubprocessCall {
    pub fn new(options: StreamMonitoredOptions) -> Result<Self, CallError> {
        let automaton = RegexAutomaton::new(&options.end_patterns)?;
        Ok(Self {
            settings: SubprocessSettings {
                command: options.command,
                cwd: options.cwd,
                env: options.env,
                timeout: options.timeout,
                no_exit_code: false,
            },
            automaton,
        })
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let options: StreamMonitoredOptions = parse_options("StreamMonitoredSubprocessCall", options)?;
        Self::new(options).map_err(|e| ConfigError::Options {
            plugin: "StreamMonitoredSubprocessCall".to_string(),
            message: e.to_string(),
        })
    }
}

impl Call for StreamMonitoredSubprocessCall {
    fn call(&mut self, input: CallInput) -> Result<Outcome, CallError> {
        let timeout = input.timeout.or_else(|| self.settings.timeout());
        let mut child = self.settings.spawn(&input.test, Stdio::null())?;

        let mut issue = Issue::new();
        let automaton = &self.automaton;
        let captured = monitor_child(&mut child, timeout, &mut |_, line| {
            let (terminate, updated) = automaton.process_line(line, &mut issue);
            terminate || updated
        })?;

        debug!(stdout = %captured.stdout, stderr = %captured.stderr, "monitored SUT finished");
        let details = process_details(&captured);
        if issue.is_empty() {
            return Ok(Outcome::NonIssue(details));
        }
        issue.extend(&details);
        Ok(Outcome::Issue(issue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{EXIT_CODE, STDERR, TIME, Value};
    use std::time::{Duration, Instant};

    fn options(script: &str, patterns: &[&str]) -> StreamMonitoredOptions {
        let base = crate::call::subprocess::sh_settings(script);
        StreamMonitoredOptions {
            command: base.command,
            cwd: None,
            env: BTreeMap::new(),
            timeout: Some(30.0),
            end_patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_match_kills_hanging_sut_promptly() {
        let mut call = StreamMonitoredSubprocessCall::new(options(
            "echo \"... ERR 42 ...\" >&2; sleep 3600",
            &[r"mst /ERR (?P<code>\d+)/"],
        ))
        .unwrap();

        let start = Instant::now();
        let outcome = call.call(CallInput::new(b"t".to_vec())).unwrap();
        let Outcome::Issue(issue) = outcome else {
            panic!("Expected an issue, got {outcome:?}");
        };
        assert_eq!(issue.text("code").as_deref(), Some("42"));
        assert!(issue.text(STDERR).is_some_and(|s| s.contains("ERR 42")));
        let time = issue.get(TIME).and_then(Value::as_f64).unwrap();
        assert!(time < 5.0, "SUT should be killed shortly after the match, took {time}");
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(
            issue.get(EXIT_CODE).and_then(Value::as_i64).is_some_and(|c| c < 0),
            "Exit code must reflect the signal"
        );
    }

    #[test]
    fn test_exit_before_match_is_a_non_issue_with_details() {
        let mut call =
            StreamMonitoredSubprocessCall::new(options("echo fine; exit 1", &[r"ERR (?P<code>\d+)"]))
                .unwrap();
        let outcome = call.call(CallInput::new(Vec::new())).unwrap();
        let Outcome::NonIssue(details) = outcome else {
            panic!("Expected a non-issue, got {outcome:?}");
        };
        assert_eq!(details.get(EXIT_CODE), Some(&Value::Int(1)));
        assert!(details.contains(TIME));
    }

    #[test]
    fn test_match_on_unterminated_last_line() {
        let mut call =
            StreamMonitoredSubprocessCall::new(options("printf \"ERR 9\"", &[r"ERR (?P<code>\d+)"]))
                .unwrap();
        let outcome = call.call(CallInput::new(Vec::new())).unwrap();
        assert_eq!(
            outcome.fields().and_then(|f| f.text("code")).as_deref(),
            Some("9")
        );
        assert!(outcome.is_issue());
    }

    #[test]
    fn test_invalid_pattern_is_rejected_at_construction() {
        assert!(StreamMonitoredSubprocessCall::new(options("true", &["mzz /x/"])).is_err());
    }
}
