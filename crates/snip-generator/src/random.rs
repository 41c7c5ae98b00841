use crate::Generator;
use jiff::Timestamp;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use typed_builder::TypedBuilder;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Settings for [`RandomKeyGenerator`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct KeySettings {
    /// Number of characters per key.
    #[builder(default = 6)]
    length: usize,
    /// Fixed seed; when unset the generator seeds itself from the wall clock.
    #[builder(default, setter(strip_option))]
    seed: Option<u64>,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Generates fixed-length keys drawn uniformly from `[A-Za-z0-9]`.
#[derive(Debug)]
pub struct RandomKeyGenerator {
    rng: Mutex<StdRng>,
    length: usize,
}

impl RandomKeyGenerator {
    pub fn new(settings: KeySettings) -> Self {
        let seed = settings
            .seed
            .unwrap_or_else(|| Timestamp::now().as_nanosecond() as u64);

        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            length: settings.length,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

impl Default for RandomKeyGenerator {
    fn default() -> Self {
        Self::new(KeySettings::default())
    }
}

impl Generator for RandomKeyGenerator {
    fn generate(&self) -> String {
        let mut rng = self.rng.lock();
        (0..self.length)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_six_alphanumeric_characters_by_default() {
        let generator = RandomKeyGenerator::default();

        for _ in 0..100 {
            let key = generator.generate();
            assert_eq!(key.len(), 6);
            assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn respects_configured_length() {
        let generator = RandomKeyGenerator::new(KeySettings::builder().length(10).build());

        assert_eq!(generator.length(), 10);
        assert_eq!(generator.generate().len(), 10);
    }

    #[test]
    fn same_seed_yields_same_sequence() {
        let first = RandomKeyGenerator::new(KeySettings::builder().seed(42).build());
        let second = RandomKeyGenerator::new(KeySettings::builder().seed(42).build());

        for _ in 0..10 {
            assert_eq!(first.generate(), second.generate());
        }
    }

    #[test]
    fn keys_rarely_repeat() {
        let generator = RandomKeyGenerator::new(KeySettings::builder().seed(7).build());

        let keys: HashSet<String> = (0..1000).map(|_| generator.generate()).collect();
        // 62^6 possible keys; a handful of collisions in 1000 draws would
        // already point at a broken distribution.
        assert!(keys.len() >= 998);
    }

    #[test]
    fn generator_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RandomKeyGenerator>();
    }
}
