//! SUT calls and the decorator chain that wraps them.
//!
//! A [`Call`] executes one test against the system under test and reports an
//! [`Outcome`]. A [`CallDecorator`] wraps an inner call: it may adjust the
//! input, filter or enrich the outcome, and hook into the `enter`/`exit`
//! scope of the call. Decorators are stacked with [`Decorated`], index 0
//! being closest to the base call.

use crate::automaton::AutomatonError;
use crate::config::{ConfigError, Options};
use crate::issue::{Issue, Outcome};
use std::time::Duration;
use thiserror::Error;

pub mod debugger;
pub mod decorators;
pub mod filters;
pub mod sanitizer;
pub mod stream;
pub mod subprocess;
pub mod test_runner;
pub mod timeout;

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Call I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Automaton(#[from] AutomatonError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Other(String),
}

/// Everything a call receives for one execution.
#[derive(Debug, Clone, Default)]
pub struct CallInput {
    pub test: Vec<u8>,
    /// Fields of a previously found issue when replaying it (validation,
    /// reduction), empty while fuzzing.
    pub hints: Issue,
    /// Per-call timeout override.
    pub timeout: Option<Duration>,
}

impl CallInput {
    pub fn new(test: Vec<u8>) -> Self {
        Self {
            test,
            ..Self::default()
        }
    }

    pub fn with_hints(test: Vec<u8>, hints: Issue) -> Self {
        Self {
            test,
            hints,
            timeout: None,
        }
    }
}

pub trait Call {
    /// Opens the call's scope before the first test of a batch.
    fn enter(&mut self) -> Result<(), CallError> {
        Ok(())
    }

    /// Closes the call's scope. Always invoked once `enter` succeeded.
    fn exit(&mut self) -> Result<(), CallError> {
        Ok(())
    }

    fn call(&mut self, input: CallInput) -> Result<Outcome, CallError>;
}

impl<C: Call + ?Sized> Call for Box<C> {
    fn enter(&mut self) -> Result<(), CallError> {
        (**self).enter()
    }

    fn exit(&mut self) -> Result<(), CallError> {
        (**self).exit()
    }

    fn call(&mut self, input: CallInput) -> Result<Outcome, CallError> {
        (**self).call(input)
    }
}

/// Behavior layered around an inner [`Call`].
///
/// Every hook receives the wrapped call; the default implementations simply
/// delegate to it.
pub trait CallDecorator {
    /// Runs before the base call is constructed and may rewrite its options.
    fn init(&mut self, _base_options: &mut Options) -> Result<(), ConfigError> {
        Ok(())
    }

    fn enter(&mut self, inner: &mut dyn Call) -> Result<(), CallError> {
        inner.enter()
    }

    fn exit(&mut self, inner: &mut dyn Call) -> Result<(), CallError> {
        inner.exit()
    }

    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        inner.call(input)
    }
}

/// A call wrapped by one decorator.
pub struct Decorated {
    decorator: Box<dyn CallDecorator>,
    inner: Box<dyn Call>,
}

impl Decorated {
    pub fn new(decorator: Box<dyn CallDecorator>, inner: Box<dyn Call>) -> Self {
        Self { decorator, inner }
    }
}

/// Records whether a decorator passed `exit` on to its inner call.
struct ExitTracker<'a> {
    inner: &'a mut dyn Call,
    exited: bool,
}

impl Call for ExitTracker<'_> {
    fn enter(&mut self) -> Result<(), CallError> {
        self.inner.enter()
    }

    fn exit(&mut self) -> Result<(), CallError> {
        self.exited = true;
        self.inner.exit()
    }

    fn call(&mut self, input: CallInput) -> Result<Outcome, CallError> {
        self.inner.call(input)
    }
}

impl Call for Decorated {
    fn enter(&mut self) -> Result<(), CallError> {
        self.decorator.enter(self.inner.as_mut())
    }

    fn exit(&mut self) -> Result<(), CallError> {
        let mut tracker = ExitTracker {
            inner: self.inner.as_mut(),
            exited: false,
        };
        let result = self.decorator.exit(&mut tracker);
        // Inner layers are closed even when this decorator failed or forgot to.
        if !tracker.exited {
            let inner_result = tracker.inner.exit();
            return result.and(inner_result);
        }
        result
    }

    fn call(&mut self, input: CallInput) -> Result<Outcome, CallError> {
        self.decorator.call(self.inner.as_mut(), input)
    }
}

/// Stacks `decorators` (innermost first) on top of `base`.
pub fn decorate(base: Box<dyn Call>, decorators: Vec<Box<dyn CallDecorator>>) -> Box<dyn Call> {
    decorators
        .into_iter()
        .fold(base, |inner, decorator| {
            Box::new(Decorated::new(decorator, inner)) as Box<dyn Call>
        })
}

/// A call backed by a closure, handy for embedding and tests.
pub struct FnCall<F>(pub F);

impl<F> Call for FnCall<F>
where
    F: FnMut(CallInput) -> Result<Outcome, CallError>,
{
    fn call(&mut self, input: CallInput) -> Result<Outcome, CallError> {
        (self.0)(input)
    }
}
