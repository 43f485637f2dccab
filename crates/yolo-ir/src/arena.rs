//! Append-only storage addressed by typed handles.
//!
//! Graph nodes refer to constant buffers through [`Handle`]s rather than
//! names, so a node can never point at a buffer of the wrong kind and
//! lookups stay O(1) no matter how many buffers the network carries.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::ops::Index;

/// Position of a value inside an [`Arena<T>`].
///
/// Stored off by one in a `NonZeroU32`, so `Option<Handle<T>>` (an optional
/// bias, say) costs no more than the handle itself.
pub struct Handle<T> {
    slot: NonZeroU32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn from_index(index: usize) -> Option<Self> {
        let slot = u32::try_from(index).ok()?.checked_add(1)?;
        Some(Self {
            slot: NonZeroU32::new(slot)?,
            _marker: PhantomData,
        })
    }

    /// Zero-based position in the arena.
    pub fn index(self) -> usize {
        self.slot.get() as usize - 1
    }
}

// Manual impls: derives would require `T` to implement each trait.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.slot.cmp(&other.slot)
    }
}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index())
    }
}

/// Values are only ever appended, so every handle handed out stays valid.
#[derive(Clone, Debug)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Store `value` and return its handle.
    ///
    /// # Panics
    ///
    /// If the arena already holds `u32::MAX` values.
    pub fn append(&mut self, value: T) -> Handle<T> {
        let Some(handle) = Handle::from_index(self.items.len()) else {
            panic!("arena is full ({} values)", self.items.len());
        };
        self.items.push(value);
        handle
    }

    pub fn try_get(&self, handle: Handle<T>) -> Option<&T> {
        self.items.get(handle.index())
    }

    /// `(handle, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, v)| Some((Handle::from_index(i)?, v)))
    }
}

impl<T> Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        &self.items[handle.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_address_appended_values() {
        let mut pool = Arena::new();
        let scale = pool.append("scale");
        let shift = pool.append("shift");
        assert_eq!(pool[scale], "scale");
        assert_eq!(pool[shift], "shift");
        assert_eq!(shift.index(), 1);
        assert!(scale < shift);

        let order: Vec<_> = pool.iter().map(|(h, v)| (h.index(), *v)).collect();
        assert_eq!(order, [(0, "scale"), (1, "shift")]);
    }

    #[test]
    fn foreign_handles_miss() {
        let mut pool = Arena::new();
        pool.append(1.0f32);
        let stray = Handle::<f32>::from_index(7).unwrap();
        assert_eq!(pool.try_get(stray), None);
    }

    #[test]
    fn optional_handle_has_no_overhead() {
        assert_eq!(
            std::mem::size_of::<Option<Handle<String>>>(),
            std::mem::size_of::<Handle<String>>()
        );
    }
}
