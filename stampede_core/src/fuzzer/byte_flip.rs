use crate::config::{ConfigError, Options, parse_options};
use crate::fuzzer::{Fuzzer, FuzzerDecorator, FuzzerError, SharedFuzzer, seeded_rng};
use rand::Rng;
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

fn default_min_byte() -> u8 {
    32
}

fn default_max_byte() -> u8 {
    126
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ByteFlipOptions {
    /// The test length divided by this number gives the count of flipped bytes.
    pub frequency: usize,
    #[serde(default = "default_min_byte")]
    pub min_byte: u8,
    #[serde(default = "default_max_byte")]
    pub max_byte: u8,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Overwrites `ceil(len / frequency)` distinct, randomly chosen positions of
/// every generated test with random bytes from `[min_byte, max_byte]`.
pub struct ByteFlipDecorator {
    frequency: usize,
    min_byte: u8,
    max_byte: u8,
    rng: ChaCha8Rng,
}

impl ByteFlipDecorator {
    pub fn new(options: ByteFlipOptions) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::Options {
            plugin: "ByteFlipDecorator".to_string(),
            message: message.to_string(),
        };
        if options.frequency == 0 {
            return Err(invalid("frequency must be positive"));
        }
        if options.min_byte > options.max_byte {
            return Err(invalid("min_byte exceeds max_byte"));
        }
        Ok(Self {
            frequency: options.frequency,
            min_byte: options.min_byte,
            max_byte: options.max_byte,
            rng: seeded_rng(options.seed),
        })
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        Self::new(parse_options("ByteFlipDecorator", options)?)
    }

    pub fn flip(&mut self, mut test: Vec<u8>) -> Vec<u8> {
        let count = test.len().div_ceil(self.frequency);
        for pos in sample(&mut self.rng, test.len(), count) {
            test[pos] = self.rng.random_range(self.min_byte..=self.max_byte);
        }
        test
    }
}

impl FuzzerDecorator for ByteFlipDecorator {
    fn generate(&mut self, inner: &mut SharedFuzzer, index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        Ok(inner.generate(index)?.map(|test| self.flip(test)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzer::{FnFuzzer, decorate_fuzzer};

    fn options(frequency: usize) -> ByteFlipOptions {
        ByteFlipOptions {
            frequency,
            min_byte: b'x',
            max_byte: b'x',
            seed: Some(3),
        }
    }

    #[test]
    fn test_flips_ceil_len_over_frequency_positions() {
        let mut decorator = ByteFlipDecorator::new(options(4)).unwrap();
        let flipped = decorator.flip(vec![b'a'; 10]);
        assert_eq!(flipped.len(), 10);
        assert_eq!(flipped.iter().filter(|&&b| b == b'x').count(), 3, "ceil(10 / 4) positions");

        let untouched = decorator.flip(Vec::new());
        assert!(untouched.is_empty());
    }

    #[test]
    fn test_decorates_generated_tests() {
        let mut fuzzer = decorate_fuzzer(
            Box::new(FnFuzzer(|_| Some(b"aaaa".to_vec()))),
            vec![Box::new(ByteFlipDecorator::new(options(1)).unwrap())],
        );
        assert_eq!(fuzzer.generate(0).unwrap(), Some(b"xxxx".to_vec()));
        assert_eq!(fuzzer.test(), None);
    }

    #[test]
    fn test_rejects_zero_frequency() {
        let options: Options = toml::from_str("frequency = 0").unwrap();
        assert!(ByteFlipDecorator::from_options(&options).is_err());
    }
}
