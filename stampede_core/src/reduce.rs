//! Test case reduction.

use crate::call::{Call, CallError, CallInput};
use crate::config::{ConfigError, Options, parse_options};
use crate::issue::{self, Issue};
use crate::job::CancelToken;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ReduceError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Reducer I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reduction cancelled")]
    Cancelled,
}

/// Everything a reducer gets for one reduction.
pub struct ReduceContext<'a> {
    /// The SUT call that reproduces the issue, already entered.
    pub sut_call: &'a mut dyn Call,
    /// The issue whose test should shrink.
    pub issue: &'a Issue,
    /// Reports the size of every accepted, smaller test.
    pub on_progress: &'a mut dyn FnMut(u64),
    /// Scratch directory owned by the reduction.
    pub work_dir: &'a Path,
    pub cancel: &'a CancelToken,
}

pub trait Reducer {
    /// Shrinks the test of `ctx.issue` while it keeps triggering the same
    /// issue.
    ///
    /// # Returns
    ///
    /// The reduced test, or `None` if it could not be reduced, and the
    /// distinct other issues found along the way.
    fn reduce(&mut self, ctx: ReduceContext<'_>) -> Result<(Option<Vec<u8>>, Vec<Issue>), ReduceError>;
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Atom {
    /// Lines first, then the bytes of the result.
    #[default]
    Line,
    Byte,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ChunkReducerOptions {
    #[serde(default)]
    pub atom: Atom,
    /// Upper bound on SUT invocations, unlimited if absent.
    #[serde(default)]
    pub max_tests: Option<u64>,
}

/// Delta debugging by complement removal: repeatedly drops chunks of the
/// test, halving the chunk size whenever no chunk can be dropped.
pub struct ChunkReducer {
    options: ChunkReducerOptions,
}

impl ChunkReducer {
    pub fn new(options: ChunkReducerOptions) -> Self {
        Self { options }
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        Ok(Self::new(parse_options("ChunkReducer", options)?))
    }
}

fn split_lines(test: &[u8]) -> Vec<Vec<u8>> {
    test.split_inclusive(|b| *b == b'\n').map(<[u8]>::to_vec).collect()
}

fn split_bytes(test: &[u8]) -> Vec<Vec<u8>> {
    test.iter().map(|b| vec![*b]).collect()
}

struct Tester<'a, 'b> {
    ctx: &'a mut ReduceContext<'b>,
    expected: String,
    tried: HashSet<Vec<u8>>,
    found: BTreeMap<String, Issue>,
    tests: u64,
    max_tests: Option<u64>,
}

impl Tester<'_, '_> {
    fn budget_left(&self) -> bool {
        self.max_tests.is_none_or(|max| self.tests < max)
    }

    /// True if `candidate` still triggers the expected issue.
    fn interesting(&mut self, candidate: Vec<u8>) -> Result<bool, ReduceError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(ReduceError::Cancelled);
        }
        if !self.tried.insert(candidate.clone()) {
            return Ok(false);
        }
        self.tests += 1;
        let input = CallInput::with_hints(candidate.clone(), self.ctx.issue.clone());
        let Some(mut found) = self.ctx.sut_call.call(input)?.into_issue() else {
            return Ok(false);
        };
        if !found.has(issue::TEST) {
            found.insert(issue::TEST, candidate.clone());
        }
        found.ensure_id();
        let id = found.id().unwrap_or_default().into_owned();
        if id == self.expected {
            (self.ctx.on_progress)(candidate.len() as u64);
            return Ok(true);
        }
        self.found.entry(id).or_insert(found);
        Ok(false)
    }

    fn minimize(&mut self, mut units: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, ReduceError> {
        let mut granularity = 2usize;
        while units.len() >= 2 && self.budget_left() {
            let chunk = units.len().div_ceil(granularity);
            let mut reduced = false;
            let mut start = 0;
            while start < units.len() && self.budget_left() {
                let end = (start + chunk).min(units.len());
                let candidate: Vec<Vec<u8>> = units[..start].iter().chain(&units[end..]).cloned().collect();
                if !candidate.is_empty() && self.interesting(candidate.concat())? {
                    units = candidate;
                    granularity = granularity.saturating_sub(1).max(2);
                    reduced = true;
                    break;
                }
                start = end;
            }
            if !reduced {
                if granularity >= units.len() {
                    break;
                }
                granularity = (granularity * 2).min(units.len());
            }
        }
        Ok(units)
    }
}

impl Reducer for ChunkReducer {
    fn reduce(&mut self, mut ctx: ReduceContext<'_>) -> Result<(Option<Vec<u8>>, Vec<Issue>), ReduceError> {
        let original = ctx.issue.test().map(|t| t.into_owned()).unwrap_or_default();
        let expected = ctx.issue.id().unwrap_or_default().into_owned();
        let mut tester = Tester {
            ctx: &mut ctx,
            expected,
            tried: HashSet::from([original.clone()]),
            found: BTreeMap::new(),
            tests: 0,
            max_tests: self.options.max_tests,
        };

        let mut current = original.clone();
        if self.options.atom == Atom::Line {
            current = tester.minimize(split_lines(&current))?.concat();
        }
        current = tester.minimize(split_bytes(&current))?.concat();
        debug!(
            tests = tester.tests,
            from = original.len(),
            to = current.len(),
            "reduction finished"
        );

        let reduced = (current.len() < original.len()).then_some(current);
        Ok((reduced, tester.found.into_values().collect()))
    }
}
