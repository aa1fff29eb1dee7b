use crate::call::subprocess::SubprocessSettings;
use crate::call::{Call, CallDecorator, CallError, CallInput};
use crate::config::{ConfigError, Options, parse_options};
use crate::issue::Outcome;
use crate::process::monitor_child;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, warn};

pub const BACKTRACE: &str = "backtrace";

const BEGIN_MARK: &str = "stampede-backtrace-begin";
const END_MARK: &str = "stampede-backtrace-end";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Debugger {
    Gdb,
    Lldb,
}

impl Debugger {
    fn name(self) -> &'static str {
        match self {
            Debugger::Gdb => "GdbBacktraceDecorator",
            Debugger::Lldb => "LldbBacktraceDecorator",
        }
    }

    fn argv(self, program: &[String]) -> Vec<String> {
        let mut argv: Vec<String> = match self {
            Debugger::Gdb => ["gdb", "-q", "-nx", "--args"].map(String::from).to_vec(),
            Debugger::Lldb => ["lldb", "--no-lldbinit", "--"].map(String::from).to_vec(),
        };
        argv.extend_from_slice(program);
        argv
    }

    /// Commands sent on the debugger's stdin: run the program with its stdin
    /// detached, then print the backtrace between two markers.
    fn script(self) -> String {
        match self {
            Debugger::Gdb => format!(
                "set pagination off\nset confirm off\nrun < /dev/null\necho {BEGIN_MARK}\\n\nbt\necho {END_MARK}\\n\nquit\n"
            ),
            Debugger::Lldb => format!(
                "settings set target.input-path /dev/null\nrun\nplatform shell echo {BEGIN_MARK}\nbt\nplatform shell echo {END_MARK}\nquit\n"
            ),
        }
    }
}

/// The text between the begin and end markers, without the marker lines.
pub fn extract_backtrace(output: &str) -> Option<String> {
    let mut lines = output.lines();
    lines.by_ref().find(|l| l.trim_end() == BEGIN_MARK)?;
    let body: Vec<&str> = lines.take_while(|l| l.trim_end() != END_MARK).collect();
    Some(body.join("\n").trim().to_string())
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct BacktraceOptions {
    /// The SUT command line, with `{test}` substitution.
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Re-runs the SUT under a debugger whenever an issue is found and attaches
/// the resulting backtrace as `backtrace`.
pub struct BacktraceDecorator {
    debugger: Debugger,
    settings: SubprocessSettings,
}

impl BacktraceDecorator {
    pub fn new(debugger: Debugger, options: BacktraceOptions) -> Self {
        Self {
            debugger,
            settings: SubprocessSettings {
                command: options.command,
                cwd: options.cwd,
                env: options.env,
                timeout: options.timeout,
                no_exit_code: false,
            },
        }
    }

    pub fn gdb(options: &Options) -> Result<Self, ConfigError> {
        Ok(Self::new(Debugger::Gdb, parse_options(Debugger::Gdb.name(), options)?))
    }

    pub fn lldb(options: &Options) -> Result<Self, ConfigError> {
        Ok(Self::new(Debugger::Lldb, parse_options(Debugger::Lldb.name(), options)?))
    }

    fn backtrace(&self, test: &[u8]) -> Result<Option<String>, CallError> {
        let program = self.settings.argv(test)?;
        let argv = self.debugger.argv(&program);
        debug!(command = ?argv, "collecting backtrace");
        let mut child = self
            .settings
            .command(&argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CallError::Spawn {
                command: argv.join(" "),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(self.debugger.script().as_bytes()) {
                warn!(error = %e, "failed to drive debugger");
            }
        }
        let captured = monitor_child(&mut child, self.settings.timeout(), &mut |_, _| false)?;
        Ok(extract_backtrace(&captured.stdout))
    }
}

impl CallDecorator for BacktraceDecorator {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        let test = input.test.clone();
        let mut outcome = inner.call(input)?;
        if let Outcome::Issue(issue) = &mut outcome {
            match self.backtrace(&test)? {
                Some(backtrace) => {
                    issue.insert(BACKTRACE, backtrace);
                }
                None => debug!("debugger produced no backtrace"),
            }
        }
        Ok(outcome)
    }
}
