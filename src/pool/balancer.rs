use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin ring of pool members, in insertion order.
#[derive(Debug)]
pub(crate) struct Ring<T> {
    members: Vec<(String, T)>,
    cursor: AtomicUsize,
}

impl<T> Default for Ring<T> {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl<T> Ring<T> {
    /// Add a member. Returns false if the address is already present.
    pub fn insert(&mut self, address: String, member: T) -> bool {
        if self.contains(&address) {
            return false;
        }
        self.members.push((address, member));
        true
    }

    pub fn remove(&mut self, address: &str) -> Option<T> {
        let idx = self.members.iter().position(|(a, _)| a == address)?;
        Some(self.members.remove(idx).1)
    }

    pub fn get(&self, address: &str) -> Option<&T> {
        self.members
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, m)| m)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.members.iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn members(&self) -> impl Iterator<Item = &T> {
        self.members.iter().map(|(_, m)| m)
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.members.drain(..).map(|(_, m)| m).collect()
    }

    /// Next member in rotation that passes `eligible`, preferring one that
    /// also passes `idle`.
    ///
    /// The cursor advances once per call so successive picks spread over
    /// the ring.
    pub fn next(&self, idle: impl Fn(&T) -> bool, eligible: impl Fn(&T) -> bool) -> Option<&T> {
        let len = self.members.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        let mut fallback = None;
        for offset in 0..len {
            let (_, member) = &self.members[(start + offset) % len];
            if !eligible(member) {
                continue;
            }
            if idle(member) {
                return Some(member);
            }
            fallback.get_or_insert(member);
        }
        fallback
    }
}
