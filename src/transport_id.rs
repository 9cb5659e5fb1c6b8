//! Allocation of the 16-bit transport IDs which tie together the
//! datagroups belonging to a single logical stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use lazy_static::lazy_static;
use rand::Rng;

lazy_static! {
    static ref DEFAULT_GENERATOR: Mutex<MemoryCachedTransportIdGenerator> =
        Mutex::new(MemoryCachedTransportIdGenerator::new());
}

/// Issues unique transport IDs, optionally keyed by a name.
pub trait TransportIdGenerator {
    /// Return an unused transport ID. Calls sharing the same `name`
    /// resolve to the same ID for the lifetime of the generator.
    fn next(&mut self, name: Option<&str>) -> u16;

    /// Whether `id` is currently on issue.
    fn exists(&self, id: u16) -> bool;
}

/// Generates transport IDs cached in memory.
///
/// IDs are drawn uniformly at random from the 16-bit space, avoiding
/// those already on issue. Once the space is exhausted the oldest
/// outstanding ID is recycled, in FIFO order.
pub struct MemoryCachedTransportIdGenerator {
    ids: VecDeque<u16>,
    cache: HashMap<String, u16>,
}

impl MemoryCachedTransportIdGenerator {
    pub fn new() -> Self {
        Self {
            ids: VecDeque::new(),
            cache: HashMap::new(),
        }
    }
}

impl Default for MemoryCachedTransportIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportIdGenerator for MemoryCachedTransportIdGenerator {
    fn next(&mut self, name: Option<&str>) -> u16 {
        if let Some(name) = name {
            if let Some(id) = self.cache.get(name) {
                return *id;
            }
        }

        // once the space is exhausted, recycle from the head
        if self.ids.len() >= (1 << 16) - 1 {
            if let Some(id) = self.ids.pop_front() {
                return id;
            }
        }

        let mut rng = rand::thread_rng();
        let mut id = rng.gen::<u16>();
        while self.ids.contains(&id) {
            id = rng.gen();
        }
        self.ids.push_back(id);
        if let Some(name) = name {
            self.cache.insert(name.to_owned(), id);
        }

        id
    }

    fn exists(&self, id: u16) -> bool {
        self.ids.contains(&id)
    }
}

/// Draw a transport ID from the process-wide [MemoryCachedTransportIdGenerator].
pub fn generate_transport_id(name: Option<&str>) -> u16 {
    DEFAULT_GENERATOR
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .next(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let mut generator = MemoryCachedTransportIdGenerator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = generator.next(None);
            assert!(seen.insert(id), "id {id:} issued twice");
            assert!(generator.exists(id));
        }
    }

    #[test]
    fn names_cache_their_id() {
        let mut generator = MemoryCachedTransportIdGenerator::new();
        let id = generator.next(Some("http://example.org/slide.jpg"));
        let other = generator.next(Some("http://example.org/other.jpg"));
        assert_ne!(id, other);
        assert_eq!(generator.next(Some("http://example.org/slide.jpg")), id);
    }

    #[test]
    fn default_generator_issues_ids() {
        let id = generate_transport_id(Some("default-generator-test"));
        assert_eq!(generate_transport_id(Some("default-generator-test")), id);
    }
}
