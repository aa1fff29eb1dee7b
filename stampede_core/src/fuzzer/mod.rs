//! Test generators and the decorator chain that wraps them.

use crate::config::{ConfigError, Options};
use crate::issue::Outcome;
use rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub mod byte_flip;
pub mod directory;
pub mod file_writer;
pub mod http;
pub mod random;
pub mod runner;

#[derive(Error, Debug)]
pub enum FuzzerError {
    #[error("Fuzzer I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Other(String),
}

/// A `Fuzzer` produces the tests a fuzz job feeds to its SUT.
///
/// Fuzzers are scoped: `enter` runs before the first request of a job and
/// `exit` after the last one. Beyond `generate`, a fuzzer may expose optional
/// capabilities that the fuzz job queries after every generation.
pub trait Fuzzer: Send {
    fn enter(&mut self) -> Result<(), FuzzerError> {
        Ok(())
    }

    fn exit(&mut self) -> Result<(), FuzzerError> {
        Ok(())
    }

    /// Requests the next test.
    ///
    /// # Arguments
    /// * `index`: the running counter of test requests within the job.
    ///
    /// # Returns
    /// `Ok(Some(test))` for a new test, `Ok(None)` when the fuzzer is exhausted
    /// and the batch should end early.
    fn generate(&mut self, index: u64) -> Result<Option<Vec<u8>>, FuzzerError>;

    /// The fuzzer's own counter, when it advances faster than one per request.
    fn index(&self) -> Option<u64> {
        None
    }

    /// The actual test content, when `generate` returned a stand-in for it
    /// (a file path or URL).
    fn test(&self) -> Option<Vec<u8>> {
        None
    }

    /// True if [`Fuzzer::test`] is the authoritative test, even while it is
    /// still `None`.
    fn provides_test(&self) -> bool {
        false
    }

    fn wants_feedback(&self) -> bool {
        false
    }

    /// Result of running the last generated test, for adaptive fuzzers.
    fn feedback(&mut self, _outcome: &Outcome) {}
}

impl<F: Fuzzer + ?Sized> Fuzzer for Box<F> {
    fn enter(&mut self) -> Result<(), FuzzerError> {
        (**self).enter()
    }

    fn exit(&mut self) -> Result<(), FuzzerError> {
        (**self).exit()
    }

    fn generate(&mut self, index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        (**self).generate(index)
    }

    fn index(&self) -> Option<u64> {
        (**self).index()
    }

    fn test(&self) -> Option<Vec<u8>> {
        (**self).test()
    }

    fn provides_test(&self) -> bool {
        (**self).provides_test()
    }

    fn wants_feedback(&self) -> bool {
        (**self).wants_feedback()
    }

    fn feedback(&mut self, outcome: &Outcome) {
        (**self).feedback(outcome)
    }
}

struct SharedState {
    fuzzer: Box<dyn Fuzzer>,
    exits: u64,
}

/// Handle to a wrapped fuzzer that decorators may clone, e.g. to serve tests
/// from a helper thread.
#[derive(Clone)]
pub struct SharedFuzzer {
    state: Arc<Mutex<SharedState>>,
}

impl SharedFuzzer {
    pub fn new(fuzzer: Box<dyn Fuzzer>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SharedState { fuzzer, exits: 0 })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn exits(&self) -> u64 {
        self.lock().exits
    }
}

impl Fuzzer for SharedFuzzer {
    fn enter(&mut self) -> Result<(), FuzzerError> {
        self.lock().fuzzer.enter()
    }

    fn exit(&mut self) -> Result<(), FuzzerError> {
        let mut state = self.lock();
        state.exits += 1;
        state.fuzzer.exit()
    }

    fn generate(&mut self, index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        self.lock().fuzzer.generate(index)
    }

    fn index(&self) -> Option<u64> {
        self.lock().fuzzer.index()
    }

    fn test(&self) -> Option<Vec<u8>> {
        self.lock().fuzzer.test()
    }

    fn provides_test(&self) -> bool {
        self.lock().fuzzer.provides_test()
    }

    fn wants_feedback(&self) -> bool {
        self.lock().fuzzer.wants_feedback()
    }

    fn feedback(&mut self, outcome: &Outcome) {
        self.lock().fuzzer.feedback(outcome)
    }
}

/// Behavior layered around an inner [`Fuzzer`], mirroring
/// [`crate::call::CallDecorator`].
pub trait FuzzerDecorator: Send {
    fn init(&mut self, _base_options: &mut Options) -> Result<(), ConfigError> {
        Ok(())
    }

    fn enter(&mut self, inner: &mut SharedFuzzer) -> Result<(), FuzzerError> {
        inner.enter()
    }

    fn exit(&mut self, inner: &mut SharedFuzzer) -> Result<(), FuzzerError> {
        inner.exit()
    }

    fn generate(&mut self, inner: &mut SharedFuzzer, index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        inner.generate(index)
    }

    fn index(&self, inner: &SharedFuzzer) -> Option<u64> {
        inner.index()
    }

    fn test(&self, inner: &SharedFuzzer) -> Option<Vec<u8>> {
        inner.test()
    }

    fn provides_test(&self, inner: &SharedFuzzer) -> bool {
        inner.provides_test()
    }

    fn wants_feedback(&self, inner: &SharedFuzzer) -> bool {
        inner.wants_feedback()
    }

    fn feedback(&mut self, inner: &mut SharedFuzzer, outcome: &Outcome) {
        inner.feedback(outcome)
    }
}

pub struct DecoratedFuzzer {
    decorator: Box<dyn FuzzerDecorator>,
    inner: SharedFuzzer,
}

impl DecoratedFuzzer {
    pub fn new(decorator: Box<dyn FuzzerDecorator>, inner: Box<dyn Fuzzer>) -> Self {
        Self {
            decorator,
            inner: SharedFuzzer::new(inner),
        }
    }
}

impl Fuzzer for DecoratedFuzzer {
    fn enter(&mut self) -> Result<(), FuzzerError> {
        self.decorator.enter(&mut self.inner)
    }

    fn exit(&mut self) -> Result<(), FuzzerError> {
        let before = self.inner.exits();
        let result = self.decorator.exit(&mut self.inner);
        if self.inner.exits() == before {
            let inner_result = self.inner.exit();
            return result.and(inner_result);
        }
        result
    }

    fn generate(&mut self, index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        self.decorator.generate(&mut self.inner, index)
    }

    fn index(&self) -> Option<u64> {
        self.decorator.index(&self.inner)
    }

    fn test(&self) -> Option<Vec<u8>> {
        self.decorator.test(&self.inner)
    }

    fn provides_test(&self) -> bool {
        self.decorator.provides_test(&self.inner)
    }

    fn wants_feedback(&self) -> bool {
        self.decorator.wants_feedback(&self.inner)
    }

    fn feedback(&mut self, outcome: &Outcome) {
        self.decorator.feedback(&mut self.inner, outcome)
    }
}

/// Stacks `decorators` (innermost first) on top of `base`.
pub fn decorate_fuzzer(base: Box<dyn Fuzzer>, decorators: Vec<Box<dyn FuzzerDecorator>>) -> Box<dyn Fuzzer> {
    decorators.into_iter().fold(base, |inner, decorator| {
        Box::new(DecoratedFuzzer::new(decorator, inner)) as Box<dyn Fuzzer>
    })
}

/// Generator for random fuzzers: reproducible with a seed, OS-seeded otherwise.
pub fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_rng(&mut rand::rng()),
    }
}

/// A fuzzer backed by a closure, handy for embedding and tests.
pub struct FnFuzzer<F>(pub F);

impl<F> Fuzzer for FnFuzzer<F>
where
    F: FnMut(u64) -> Option<Vec<u8>> + Send,
{
    fn generate(&mut self, index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        Ok((self.0)(index))
    }
}
