use crate::automaton::RegexAutomaton;
use crate::call::{Call, CallDecorator, CallError, CallInput};
use crate::config::{ConfigError, Options, parse_options};
use crate::issue::{EXIT_CODE, Issue, Outcome, STDERR, Value};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

/// Reads an option that may hold a single string or an array of strings.
pub(crate) fn string_list(plugin: &str, key: &str, value: &toml::Value) -> Result<Vec<String>, ConfigError> {
    let bad = || ConfigError::Options {
        plugin: plugin.to_string(),
        message: format!("'{key}' must be a string or a list of strings"),
    };
    match value {
        toml::Value::String(s) => Ok(vec![s.clone()]),
        toml::Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(bad))
            .collect(),
        _ => Err(bad()),
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExitCodeFilterOptions {
    pub exit_codes: Vec<i64>,
    /// Keep issues whose exit code is *not* listed.
    #[serde(default)]
    pub invert: bool,
}

/// Keeps an issue only if its `exit_code` is one of the configured codes.
pub struct ExitCodeFilter {
    exit_codes: Vec<i64>,
    invert: bool,
}

impl ExitCodeFilter {
    pub fn new(exit_codes: Vec<i64>) -> Self {
        Self {
            exit_codes,
            invert: false,
        }
    }

    pub fn inverted(mut self) -> Self {
        self.invert = !self.invert;
        self
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let options: ExitCodeFilterOptions = parse_options("ExitCodeFilter", options)?;
        Ok(Self {
            exit_codes: options.exit_codes,
            invert: options.invert,
        })
    }
}

impl CallDecorator for ExitCodeFilter {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        let outcome = inner.call(input)?;
        let Outcome::Issue(issue) = outcome else {
            return Ok(outcome);
        };
        let code = issue.get(EXIT_CODE).and_then(Value::as_i64);
        if code.is_some_and(|c| self.exit_codes.contains(&c)) != self.invert {
            Ok(Outcome::Issue(issue))
        } else {
            Ok(Outcome::NonIssue(issue))
        }
    }
}

/// Searches fields of an issue with regexes and keeps the issue only if at
/// least one pattern matched, merging the named groups into it.
///
/// Every option is a field name mapped to one or more patterns. Patterns run
/// in multi-line, dot-matches-newline mode.
pub struct RegexFilter {
    patterns: Vec<(String, Vec<Regex>)>,
}

impl RegexFilter {
    pub fn new(patterns: Vec<(String, Vec<String>)>) -> Result<Self, regex::Error> {
        let patterns = patterns
            .into_iter()
            .map(|(field, sources)| {
                let compiled = sources
                    .iter()
                    .map(|p| {
                        RegexBuilder::new(p)
                            .multi_line(true)
                            .dot_matches_new_line(true)
                            .build()
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((field, compiled))
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { patterns })
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let patterns = options
            .iter()
            .map(|(k, v)| Ok((k.clone(), string_list("RegexFilter", k, v)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Self::new(patterns).map_err(|e| ConfigError::Options {
            plugin: "RegexFilter".to_string(),
            message: e.to_string(),
        })
    }
}

impl CallDecorator for RegexFilter {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        let outcome = inner.call(input)?;
        let Outcome::Issue(mut issue) = outcome else {
            return Ok(outcome);
        };

        let mut updated = false;
        for (field, regexes) in &self.patterns {
            let haystack = issue.text(field).map(|t| t.into_owned()).unwrap_or_default();
            for regex in regexes {
                let Some(caps) = regex.captures(&haystack) else {
                    continue;
                };
                for name in regex.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        issue.insert(name, m.as_str());
                    }
                }
                updated = true;
            }
        }

        Ok(Outcome::from_fields(issue, updated))
    }
}

/// Runs regex automata over fields of an issue.
///
/// For each configured field, the field's lines are processed by an automaton
/// that treats the issue's current keys as existing. The fields collected
/// across all automata are merged into the issue; if nothing was collected
/// the issue is demoted to a non-issue. A terminating instruction ends the
/// processing of the remaining fields.
pub struct RegexAutomatonFilter {
    patterns: Vec<(String, Vec<String>)>,
}

impl RegexAutomatonFilter {
    pub fn new(patterns: Vec<(String, Vec<String>)>) -> Result<Self, CallError> {
        // Validate eagerly so that bad instructions fail at configuration time.
        for (_, instructions) in &patterns {
            RegexAutomaton::new(instructions)?;
        }
        Ok(Self { patterns })
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let patterns = options
            .iter()
            .map(|(k, v)| Ok((k.clone(), string_list("RegexAutomatonFilter", k, v)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Self::new(patterns).map_err(|e| ConfigError::Options {
            plugin: "RegexAutomatonFilter".to_string(),
            message: e.to_string(),
        })
    }

    pub(crate) fn filter(&self, mut issue: Issue) -> Result<Outcome, CallError> {
        let mut details = Issue::new();
        for (field, instructions) in &self.patterns {
            let automaton =
                RegexAutomaton::with_existing_fields(instructions, issue.keys().map(str::to_string))?;
            let text = issue.text(field).map(|t| t.into_owned()).unwrap_or_default();
            let lines: Vec<&str> = text.lines().collect();
            let (terminate, _) = automaton.process(&lines, &mut details);
            if terminate {
                break;
            }
        }

        if details.is_empty() {
            return Ok(Outcome::NonIssue(issue));
        }
        issue.extend(&details);
        Ok(Outcome::Issue(issue))
    }
}

impl CallDecorator for RegexAutomatonFilter {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        match inner.call(input)? {
            Outcome::Issue(issue) => self.filter(issue),
            other => Ok(other),
        }
    }
}

const STACK_PREFIX: &str = r"#(?P<frame_id>\d+)\s+(?P<address>[xX\da-fA-F]+)\s+";
const STACK_FUNCTION_OFFSET: &str = r"in\s+(?P<function>.+?)\s*(\+(?P<offset>[xX\da-fA-F]+))?\s+";
const STACK_FILE_LINE_CHAR: &str = r"(?P<file>[^()]+?):(?P<line>\d+)(?::(?P<char>\d+))?";
const STACK_MODULE_OFFSET: &str = r"\((?P<module>[^+]+)(\+(?P<module_offset>[xX\da-fA-F]+))?\)";
const STACK_FUNCTION_MODULE_OFFSET: &str =
    r"in\s*(?P<function>.+?)\s+\((?P<module>.+?)\+(?P<module_offset>[xX\da-fA-F]+)\)";

/// Instructions recognizing AddressSanitizer / UBSan reports: the error
/// summary line, the memory access kind, and the first relevant stack frame.
pub fn sanitizer_patterns() -> Vec<String> {
    vec![
        r"mns /libsystem_platform|libclang_rt|libdyld|libc.so|glibc|libasan.so/".to_string(),
        r"mac /The signal is caused by a (?P<mem_access>[A-Z]+) memory access/".to_string(),
        r"mac /(?P<mem_access>[A-Z]+ of size \d+)/".to_string(),
        concat!(
            r"mas /\s+(?P<sanitizer>.+?Sanitizer)\s*:\s+(?P<error_type>.+?) on ",
            r"(?P<address_type>unknown address|address|)\s*(?P<address>[xX0-9a-fA-F]+)/"
        )
        .to_string(),
        r"mas /^((?P<file>[^: ]+):(?P<line>\d+)(?::(?P<char>\d+))?:\s+)?(?P<ubsan>runtime error): (?P<error_type>.*)/"
            .to_string(),
        r"mac /(?P<error_type>Received signal 11 SEGV_[A-Z]+) ([0-9a-f]*)/".to_string(),
        format!("mat /{STACK_PREFIX}{STACK_FUNCTION_OFFSET}{STACK_FILE_LINE_CHAR}/"),
        format!("mat /{STACK_PREFIX}{STACK_FUNCTION_OFFSET}{STACK_MODULE_OFFSET}/"),
        format!("mat /{STACK_PREFIX}{STACK_FUNCTION_MODULE_OFFSET}/"),
        format!("mat /{STACK_PREFIX}{STACK_FUNCTION_OFFSET}/"),
        format!("mas /{STACK_PREFIX}{STACK_MODULE_OFFSET}/"),
        r"mac /pc (?P<pc_zero>\(nil\)|0x00000000|0x000000000000)/".to_string(),
    ]
}

/// A [`RegexAutomatonFilter`] preloaded with sanitizer report patterns.
///
/// User patterns of a field come first, the built-in ones are appended for
/// every field in `sanitized_properties` (default: `stderr`).
pub struct SanitizerAutomatonFilter {
    inner: RegexAutomatonFilter,
}

impl SanitizerAutomatonFilter {
    pub fn new(
        mut patterns: Vec<(String, Vec<String>)>,
        sanitized_properties: Vec<String>,
    ) -> Result<Self, CallError> {
        for property in sanitized_properties {
            match patterns.iter_mut().find(|(field, _)| *field == property) {
                Some((_, list)) => list.extend(sanitizer_patterns()),
                None => patterns.push((property, sanitizer_patterns())),
            }
        }
        Ok(Self {
            inner: RegexAutomatonFilter::new(patterns)?,
        })
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        const PLUGIN: &str = "SanitizerAutomatonFilter";
        let mut patterns = Vec::new();
        let mut properties = vec![STDERR.to_string()];
        for (key, value) in options {
            if key == "sanitized_properties" {
                properties = string_list(PLUGIN, key, value)?;
            } else {
                patterns.push((key.clone(), string_list(PLUGIN, key, value)?));
            }
        }
        Self::new(patterns, properties).map_err(|e| ConfigError::Options {
            plugin: PLUGIN.to_string(),
            message: e.to_string(),
        })
    }
}

impl CallDecorator for SanitizerAutomatonFilter {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        match inner.call(input)? {
            Outcome::Issue(issue) => self.inner.filter(issue),
            other => Ok(other),
        }
    }
}
