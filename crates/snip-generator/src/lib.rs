pub mod random;

pub use random::{KeySettings, RandomKeyGenerator};

/// Trait for generating short keys.
///
/// Implementations are pure generators that don't interact with storage.
/// They do not guarantee uniqueness; callers are expected to check the
/// generated key against the store and retry on collision.
pub trait Generator: Send + Sync + 'static {
    /// Generates a candidate short key.
    fn generate(&self) -> String;
}
