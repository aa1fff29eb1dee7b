//! Line-oriented regex automaton used to pick fields out of program output.
//!
//! Each instruction has the form `m<F><N> /regex/`:
//!
//! * `F` (field op): `s` set every named group, `a` add groups not yet present,
//!   `c` clear the issue, `n` match without recording.
//! * `N` (next-line op): `c` continue with the next instruction, `s` stop
//!   processing the current line, `t` terminate processing altogether.
//!
//! A pattern without the `m..` prefix is shorthand for `msc /pattern/`.

use crate::issue::{Issue, Value};
use regex::Regex;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutomatonError {
    #[error("Unknown field operation '{op}' in automaton pattern: {pattern}")]
    UnknownFieldOp { op: char, pattern: String },
    #[error("Unknown next-line operation '{op}' in automaton pattern: {pattern}")]
    UnknownNextLineOp { op: char, pattern: String },
    #[error("Invalid regex in automaton pattern {pattern}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Set,
    Add,
    Clear,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextLineOp {
    Continue,
    Stop,
    Terminate,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub field_op: FieldOp,
    pub next_line_op: NextLineOp,
    pub regex: Regex,
}

/// Splits `m<F><N> /body/` into its parts, `None` for a bare pattern.
fn split_prefix(pattern: &str) -> Option<(char, char, &str)> {
    let mut chars = pattern.chars();
    if chars.next()? != 'm' {
        return None;
    }
    let field = chars.next()?;
    let next = chars.next()?;
    let rest = chars.as_str().trim_start_matches(' ');
    let body = rest.strip_prefix('/')?.strip_suffix('/')?;
    Some((field, next, body))
}

/// Parses one instruction, falling back to `msc` for bare patterns.
pub fn split_pattern(pattern: &str) -> Result<Instruction, AutomatonError> {
    let (field, next, body) = split_prefix(pattern).unwrap_or(('s', 'c', pattern));

    let field_op = match field {
        's' => FieldOp::Set,
        'a' => FieldOp::Add,
        'c' => FieldOp::Clear,
        'n' => FieldOp::None,
        op => {
            return Err(AutomatonError::UnknownFieldOp {
                op,
                pattern: pattern.to_string(),
            });
        }
    };
    let next_line_op = match next {
        'c' => NextLineOp::Continue,
        's' => NextLineOp::Stop,
        't' => NextLineOp::Terminate,
        op => {
            return Err(AutomatonError::UnknownNextLineOp {
                op,
                pattern: pattern.to_string(),
            });
        }
    };
    let regex = Regex::new(body).map_err(|source| AutomatonError::Regex {
        pattern: pattern.to_string(),
        source,
    })?;

    Ok(Instruction {
        field_op,
        next_line_op,
        regex,
    })
}

#[derive(Debug, Clone)]
pub struct RegexAutomaton {
    instructions: Vec<Instruction>,
    existing_fields: BTreeSet<String>,
}

impl RegexAutomaton {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, AutomatonError> {
        Self::with_existing_fields(patterns, std::iter::empty::<String>())
    }

    /// `existing_fields` are treated as already present by `a` instructions,
    /// so that they never get overwritten with data from the output.
    pub fn with_existing_fields<S, I>(patterns: &[S], existing_fields: I) -> Result<Self, AutomatonError>
    where
        S: AsRef<str>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let instructions = patterns
            .iter()
            .map(|p| split_pattern(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            instructions,
            existing_fields: existing_fields.into_iter().map(Into::into).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Runs every instruction against `line`.
    ///
    /// Returns `(terminate, updated)`: `terminate` when a `t` instruction
    /// matched, `updated` when any match produced at least one non-empty
    /// named group.
    pub fn process_line(&self, line: &str, issue: &mut Issue) -> (bool, bool) {
        let mut updated = false;

        for instruction in &self.instructions {
            let Some(caps) = instruction.regex.captures(line) else {
                continue;
            };

            let groups: Vec<(&str, &str)> = instruction
                .regex
                .capture_names()
                .flatten()
                .filter_map(|name| caps.name(name).map(|m| (name, m.as_str())))
                .collect();

            match instruction.field_op {
                FieldOp::Set => {
                    for (name, value) in &groups {
                        issue.insert(name, Value::from(*value));
                    }
                }
                FieldOp::Add => {
                    for (name, value) in &groups {
                        if !issue.contains(name) && !self.existing_fields.contains(*name) {
                            issue.insert(name, Value::from(*value));
                        }
                    }
                }
                FieldOp::Clear => issue.clear(),
                FieldOp::None => {}
            }

            if !groups.is_empty() {
                updated = true;
            }

            match instruction.next_line_op {
                NextLineOp::Continue => continue,
                NextLineOp::Stop => break,
                NextLineOp::Terminate => return (true, updated),
            }
        }

        (false, updated)
    }

    /// Feeds lines in order until a terminating instruction fires.
    pub fn process<S: AsRef<str>>(&self, lines: &[S], issue: &mut Issue) -> (bool, bool) {
        let mut updated = false;
        for line in lines {
            let (terminate, line_updated) = self.process_line(line.as_ref(), issue);
            updated |= line_updated;
            if terminate {
                return (true, updated);
            }
        }
        (false, updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_pattern_defaults_to_set_continue() {
        let instr = split_pattern(r"ERR (?P<code>\d+)").unwrap();
        assert_eq!(instr.field_op, FieldOp::Set);
        assert_eq!(instr.next_line_op, NextLineOp::Continue);
        assert!(instr.regex.is_match("ERR 42"));
    }

    #[test]
    fn test_prefixed_pattern_parses_ops() {
        let instr = split_pattern(r"mat /#(?P<frame>\d+)/").unwrap();
        assert_eq!(instr.field_op, FieldOp::Add);
        assert_eq!(instr.next_line_op, NextLineOp::Terminate);
        assert_eq!(instr.regex.as_str(), r"#(?P<frame>\d+)");
    }

    #[test]
    fn test_unknown_ops_are_rejected() {
        assert!(matches!(
            split_pattern("mxc /foo/"),
            Err(AutomatonError::UnknownFieldOp { op: 'x', .. })
        ));
        assert!(matches!(
            split_pattern("msq /foo/"),
            Err(AutomatonError::UnknownNextLineOp { op: 'q', .. })
        ));
    }

    #[test]
    fn test_empty_input_is_a_no_op() {
        let automaton = RegexAutomaton::new(&["msc /ERR (?P<code>\\d+)/"]).unwrap();
        let mut issue = Issue::new();
        let lines: [&str; 0] = [];
        assert_eq!(automaton.process(&lines, &mut issue), (false, false));
        assert!(issue.is_empty());
    }

    #[test]
    fn test_terminal_match_stops_processing() {
        let automaton =
            RegexAutomaton::new(&[r"mst /ERR (?P<code>\d+)/", r"msc /(?P<later>.+)/"]).unwrap();
        let mut issue = Issue::new();
        let result = automaton.process(&["boot", "ERR 42", "after"], &mut issue);
        assert_eq!(result, (true, true));
        assert_eq!(issue.text("code").as_deref(), Some("42"));
        assert_eq!(
            issue.text("later").as_deref(),
            Some("boot"),
            "Lines after the terminating one must not be processed"
        );
    }

    #[test]
    fn test_add_does_not_overwrite_existing_or_protected_fields() {
        let automaton =
            RegexAutomaton::with_existing_fields(&[r"mac /(?P<a>\w+) (?P<b>\w+) (?P<c>\w+)/"], ["c"])
                .unwrap();
        let mut issue = Issue::new().with("a", "keep");
        automaton.process_line("x y z", &mut issue);
        assert_eq!(issue.text("a").as_deref(), Some("keep"));
        assert_eq!(issue.text("b").as_deref(), Some("y"));
        assert!(!issue.contains("c"));
    }

    #[test]
    fn test_clear_and_none_ops() {
        let automaton = RegexAutomaton::new(&[r"mcc /(?P<x>\d)/", r"mnc /(?P<y>\d)/"]).unwrap();
        let mut issue = Issue::new().with("old", "value");
        let (terminate, updated) = automaton.process_line("7", &mut issue);
        assert!(!terminate);
        assert!(updated, "Named groups matched, so the line counts as updating");
        assert!(!issue.contains("old"));
        assert!(!issue.contains("x"), "Clearing does not record groups");
        assert!(!issue.contains("y"));
    }

    #[test]
    fn test_clear_leaves_empty_issue() {
        let automaton = RegexAutomaton::new(&[r"mcc /(?P<x>\d)/"]).unwrap();
        let mut issue = Issue::new().with("old", "value");
        let (_, updated) = automaton.process_line("7", &mut issue);
        assert!(updated);
        assert!(issue.is_empty(), "{issue:?}");
    }

    #[test]
    fn test_stop_skips_remaining_instructions_for_line_only() {
        let automaton = RegexAutomaton::new(&[r"mns /skip/", r"msc /(?P<v>\w+)/"]).unwrap();
        let mut issue = Issue::new();
        automaton.process(&["skip me", "value"], &mut issue);
        assert_eq!(issue.text("v").as_deref(), Some("value"));
    }

    #[test]
    fn test_unmatched_optional_group_is_not_recorded() {
        let automaton = RegexAutomaton::new(&[r"(?P<a>A)(?P<b>B)?"]).unwrap();
        let mut issue = Issue::new();
        automaton.process_line("A", &mut issue);
        assert!(issue.contains("a"));
        assert!(!issue.contains("b"));
    }
}
