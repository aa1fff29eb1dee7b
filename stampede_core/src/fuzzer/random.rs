use crate::config::{ConfigError, Options, parse_options};
use crate::fuzzer::{Fuzzer, FuzzerError, seeded_rng};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

const CONTENT_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn one() -> usize {
    1
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RandomContentOptions {
    #[serde(default = "one")]
    pub min_length: usize,
    #[serde(default = "one")]
    pub max_length: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Strings of uppercase ASCII letters and digits with a random length in
/// `[min_length, max_length]`.
pub struct RandomContent {
    min_length: usize,
    max_length: usize,
    rng: ChaCha8Rng,
}

impl RandomContent {
    pub fn new(options: RandomContentOptions) -> Result<Self, ConfigError> {
        if options.min_length > options.max_length {
            return Err(ConfigError::Options {
                plugin: "RandomContent".to_string(),
                message: format!(
                    "min_length {} exceeds max_length {}",
                    options.min_length, options.max_length
                ),
            });
        }
        Ok(Self {
            min_length: options.min_length,
            max_length: options.max_length,
            rng: seeded_rng(options.seed),
        })
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        Self::new(parse_options("RandomContent", options)?)
    }
}

impl Fuzzer for RandomContent {
    fn generate(&mut self, _index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        let length = self.rng.random_range(self.min_length..=self.max_length);
        let test = (0..length)
            .map(|_| CONTENT_ALPHABET[self.rng.random_range(0..CONTENT_ALPHABET.len())])
            .collect();
        Ok(Some(test))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RandomIntegerOptions {
    pub min_value: i64,
    pub max_value: i64,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// A single random integer from `[min_value, max_value]`, rendered as decimal text.
pub struct RandomInteger {
    min_value: i64,
    max_value: i64,
    rng: ChaCha8Rng,
}

impl RandomInteger {
    pub fn new(options: RandomIntegerOptions) -> Result<Self, ConfigError> {
        if options.min_value > options.max_value {
            return Err(ConfigError::Options {
                plugin: "RandomInteger".to_string(),
                message: format!(
                    "min_value {} exceeds max_value {}",
                    options.min_value, options.max_value
                ),
            });
        }
        Ok(Self {
            min_value: options.min_value,
            max_value: options.max_value,
            rng: seeded_rng(options.seed),
        })
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        Self::new(parse_options("RandomInteger", options)?)
    }
}

impl Fuzzer for RandomInteger {
    fn generate(&mut self, _index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        let value = self.rng.random_range(self.min_value..=self.max_value);
        Ok(Some(value.to_string().into_bytes()))
    }
}
