//! Fixed-capacity arena with generation-tagged keys.
//!
//! `Pool` replaces static arrays threaded with a free list. Storage is
//! allocated once at construction; `insert` and `remove` never touch the
//! allocator afterwards. Every slot carries a generation that is bumped on
//! removal, so a stale `Key` can never reach a recycled entry.

use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

/// Typed handle into a `Pool<T>`.
pub struct Key<T> {
    index: u16,
    generation: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    fn new(index: u16, generation: u16) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index inside the pool.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

// Manual impls so `Key<T>` is Copy regardless of `T`.
impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Key<T> {}

impl<T> Hash for Key<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}v{})", self.index, self.generation)
    }
}

enum Entry<T> {
    Occupied { generation: u16, value: T },
    Vacant { generation: u16, next_free: Option<u16> },
}

/// Fixed-capacity slot map with an embedded free list.
pub struct Pool<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u16>,
    len: usize,
}

impl<T> Pool<T> {
    /// Create a pool holding at most `capacity` values (clamped to `u16::MAX`).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let mut entries = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next_free = if i + 1 < capacity {
                Some((i + 1) as u16)
            } else {
                None
            };
            entries.push(Entry::Vacant {
                generation: 0,
                next_free,
            });
        }
        Self {
            entries,
            free_head: if capacity > 0 { Some(0) } else { None },
            len: 0,
        }
    }

    /// Insert a value, handing it back if the pool is full.
    pub fn insert(&mut self, value: T) -> Result<Key<T>, T> {
        let Some(index) = self.free_head else {
            return Err(value);
        };
        let slot = &mut self.entries[index as usize];
        let (generation, next_free) = match slot {
            Entry::Vacant {
                generation,
                next_free,
            } => (*generation, *next_free),
            // Free list only ever points at vacant slots.
            Entry::Occupied { .. } => return Err(value),
        };
        *slot = Entry::Occupied { generation, value };
        self.free_head = next_free;
        self.len += 1;
        Ok(Key::new(index, generation))
    }

    /// Remove a value, returning it if the key was live.
    pub fn remove(&mut self, key: Key<T>) -> Option<T> {
        let slot = self.entries.get_mut(key.index as usize)?;
        match slot {
            Entry::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }
        let vacant = Entry::Vacant {
            generation: key.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let old = core::mem::replace(slot, vacant);
        self.free_head = Some(key.index);
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    pub fn get(&self, key: Key<T>) -> Option<&T> {
        match self.entries.get(key.index as usize)? {
            Entry::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: Key<T>) -> Option<&mut T> {
        match self.entries.get_mut(key.index as usize)? {
            Entry::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: Key<T>) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.capacity() - self.len
    }

    /// Iterate over live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Key<T>, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| match entry {
                Entry::Occupied { generation, value } => {
                    Some((Key::new(i as u16, *generation), value))
                }
                Entry::Vacant { .. } => None,
            })
    }

    /// Iterate mutably over live entries in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Key<T>, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, entry)| match entry {
                Entry::Occupied { generation, value } => {
                    Some((Key::new(i as u16, *generation), value))
                }
                Entry::Vacant { .. } => None,
            })
    }

    /// Find the first live entry matching a predicate.
    pub fn find<F>(&self, mut f: F) -> Option<(Key<T>, &T)>
    where
        F: FnMut(&T) -> bool,
    {
        self.iter().find(|(_, v)| f(v))
    }
}
