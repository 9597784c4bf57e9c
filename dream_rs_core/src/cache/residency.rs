use std::collections::{BTreeMap, HashMap};

/// Recency order of resident models, oldest first.
///
/// Every touch stamps the name with a fresh, monotonically increasing sequence number, so
/// recency updates and oldest lookups never scan the whole order.
#[derive(Debug, Clone, Default)]
pub struct ResidencyOrder {
    stamps: HashMap<String, u64>,
    order: BTreeMap<u64, String>,
    next_stamp: u64,
}

impl ResidencyOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `name` to the most recently used position, inserting it if absent.
    pub fn touch(&mut self, name: &str) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some(old) = self.stamps.insert(name.to_string(), stamp) {
            self.order.remove(&old);
        }
        self.order.insert(stamp, name.to_string());
    }

    pub fn remove(&mut self, name: &str) -> bool {
        match self.stamps.remove(name) {
            Some(stamp) => {
                self.order.remove(&stamp);
                true
            }
            None => false,
        }
    }

    /// The least recently used name other than `skip`.
    pub fn oldest_except(&self, skip: Option<&str>) -> Option<&str> {
        self.order
            .values()
            .map(String::as_str)
            .find(|name| Some(*name) != skip)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stamps.contains_key(name)
    }

    /// Names from least to most recently used.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.stamps.clear();
        self.order.clear();
    }
}
