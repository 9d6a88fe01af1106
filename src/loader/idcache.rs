//! Global identifier index and UUID generation.
//!
//! The cache is the single source of truth for "does this identifier
//! already exist". Every insertion into the model must be indexed here
//! first, and every deletion must remove its entries, or lookups would
//! resolve to dead elements.

use rustc_hash::FxHashMap;
use uuid::Uuid;

use super::ElementRef;
use crate::error::{Error, Result};

/// Environment variable holding the deterministic UUID seed.
pub const SEED_ENV_VAR: &str = "MELODEL_UUID_SEED";

/// Loader-wide configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoaderConfig {
    /// Seed for deterministic identifier generation. `None` draws
    /// random UUIDs.
    pub seed: Option<u64>,
}

impl LoaderConfig {
    /// Read the configuration from the process environment.
    ///
    /// An unparseable seed is ignored with a warning rather than
    /// failing model loading.
    pub fn from_env() -> Self {
        let seed = match std::env::var(SEED_ENV_VAR) {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(seed) => Some(seed),
                Err(_) => {
                    tracing::warn!("Ignoring unparseable {SEED_ENV_VAR}: {raw:?}");
                    None
                }
            },
            Err(_) => None,
        };
        Self { seed }
    }
}

/// Identifier -> element index spanning all loaded fragments.
///
/// `None` entries are reservations: the identifier is taken, but the
/// element carrying it has not been inserted yet.
#[derive(Clone, Debug, Default)]
pub struct IdCache {
    entries: FxHashMap<String, Option<ElementRef>>,
    rng: Option<SplitMix64>,
}

impl IdCache {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            entries: FxHashMap::default(),
            rng: config.seed.map(SplitMix64::new),
        }
    }

    /// Bind `id` to `elem`.
    ///
    /// Binding an identifier that is already held by a *different*
    /// element fails; re-binding the same element and claiming a
    /// reserved identifier are both fine.
    pub fn index(&mut self, id: impl Into<String>, elem: ElementRef) -> Result<()> {
        let id = id.into();
        match self.entries.get(&id) {
            Some(Some(existing)) if *existing != elem => {
                Err(Error::DuplicateIdentifier { id })
            }
            _ => {
                self.entries.insert(id, Some(elem));
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Option<ElementRef> {
        self.entries.get(id).copied().flatten()
    }

    /// Whether `id` is taken, by a live element or a reservation.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove `id` from the index. Idempotent.
    pub fn remove(&mut self, id: &str) {
        self.entries.remove(id);
    }

    /// Mark `id` as taken for an element that will be inserted later.
    pub fn reserve(&mut self, id: impl Into<String>) {
        self.entries.entry(id.into()).or_insert(None);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Generate an identifier that is unused across all loaded
    /// fragments, and reserve it.
    ///
    /// With a configured seed the draw sequence is reproducible between
    /// runs with identical creation order. A candidate colliding with an
    /// existing identifier is discarded and the generator re-queried, so
    /// a seeded run skips values after a collision.
    pub fn generate_uuid(&mut self) -> String {
        loop {
            let candidate = match &mut self.rng {
                Some(rng) => {
                    let mut bytes = [0u8; 16];
                    bytes[..8].copy_from_slice(&rng.next_u64().to_be_bytes());
                    bytes[8..].copy_from_slice(&rng.next_u64().to_be_bytes());
                    uuid::Builder::from_random_bytes(bytes).into_uuid()
                }
                None => Uuid::new_v4(),
            };
            let id = candidate.to_string();
            if !self.entries.contains_key(&id) {
                self.reserve(id.clone());
                return id;
            }
        }
    }
}

/// SplitMix64 generator backing seeded identifier generation.
#[derive(Clone, Debug)]
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}
