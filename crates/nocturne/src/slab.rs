// src/slab.rs

enum Entry<T> {
    Occupied(T),
    Vacant(Option<usize>),
}

/// Index-addressed storage with an intrusive free list.
///
/// Slots are reused LIFO, so an index alone does not identify an entry over
/// time; callers that hand indices to the kernel pair them with a serial.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    head_free: Option<usize>,
    active_count: usize,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            head_free: None,
            active_count: 0,
        }
    }

    /// O(1) insertion: reuses the most recently freed slot, or grows.
    pub fn insert(&mut self, value: T) -> usize {
        self.active_count += 1;
        match self.head_free {
            Some(idx) => {
                if let Entry::Vacant(next) = self.entries[idx] {
                    self.head_free = next;
                }
                self.entries[idx] = Entry::Occupied(value);
                idx
            }
            None => {
                self.entries.push(Entry::Occupied(value));
                self.entries.len() - 1
            }
        }
    }

    /// O(1) removal. Vacant or out-of-range indices return `None`.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let entry = self.entries.get_mut(index)?;
        if let Entry::Vacant(_) = entry {
            return None; // Double free prevention
        }
        let old = std::mem::replace(entry, Entry::Vacant(self.head_free));
        self.head_free = Some(index);
        self.active_count -= 1;
        match old {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        match self.entries.get(index)? {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        match self.entries.get_mut(index)? {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    /// Indices of occupied slots.
    pub fn keys(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| matches!(e, Entry::Occupied(_)).then_some(i))
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<T> {
        self.head_free = None;
        self.active_count = 0;
        std::mem::take(&mut self.entries)
            .into_iter()
            .filter_map(|e| match e {
                Entry::Occupied(value) => Some(value),
                Entry::Vacant(_) => None,
            })
            .collect()
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}
