//! Arena-based storage with typed handles.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A typed handle into an [`Arena`].
///
/// Handles are lightweight identifiers (u32 index) that provide
/// type-safe access to arena-allocated values. They are only valid for
/// the lifetime of one compilation of one kernel.
pub struct Handle<T> {
    index: u32,
    _phantom: PhantomData<T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.index)
    }
}

impl<T> Handle<T> {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// Returns the zero-based index of this handle.
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Rebuilds a handle from a dense index previously obtained through
    /// [`Handle::index`]. Analyses use this to key side tables by plain
    /// integers and round-trip back to handles.
    pub fn from_index(index: usize) -> Self {
        let index = u32::try_from(index)
            .unwrap_or_else(|_| panic!("handle index {index} exceeds u32::MAX"));
        Self::new(index)
    }
}

/// An append-only arena with typed [`Handle`]-based access.
#[derive(Clone, Debug)]
pub struct Arena<T> {
    data: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Returns the number of elements in the arena.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the arena contains no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends a value and returns its handle.
    pub fn append(&mut self, value: T) -> Handle<T> {
        let index = u32::try_from(self.data.len()).unwrap_or_else(|_| {
            panic!("arena overflow: {} items exceeds u32::MAX", self.data.len())
        });
        self.data.push(value);
        Handle::new(index)
    }

    /// Returns a reference to the value if the handle is valid.
    pub fn try_get(&self, handle: Handle<T>) -> Option<&T> {
        self.data.get(handle.index())
    }

    /// Iterates over `(handle, &value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        // Safety: arena size bounded by u32::MAX (enforced in append)
        self.data
            .iter()
            .enumerate()
            .map(|(i, v)| (Handle::new(i as u32), v))
    }

    /// Iterates over `(handle, &mut value)` pairs.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        // Safety: arena size bounded by u32::MAX (enforced in append)
        self.data
            .iter_mut()
            .enumerate()
            .map(|(i, v)| (Handle::new(i as u32), v))
    }
}

impl<T> Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        &self.data[handle.index()]
    }
}

impl<T> IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        &mut self.data[handle.index()]
    }
}

/// A dense side table keyed by arena handles.
///
/// Analysis passes attach facts to IR values with these instead of
/// pointer-keyed maps; the table is a plain vector indexed by the handle's
/// integer id, so stale entries are impossible to confuse across arenas of
/// different lifetimes.
#[derive(Clone, Debug)]
pub struct HandleMap<T, V> {
    data: Vec<Option<V>>,
    _phantom: PhantomData<T>,
}

impl<T, V> Default for HandleMap<T, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, V> HandleMap<T, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            _phantom: PhantomData,
        }
    }

    /// Inserts a value for a handle, returning any previous value.
    pub fn insert(&mut self, handle: Handle<T>, value: V) -> Option<V> {
        let index = handle.index();
        if index >= self.data.len() {
            self.data.resize_with(index + 1, || None);
        }
        self.data[index].replace(value)
    }

    /// Returns the value attached to the handle, if any.
    pub fn get(&self, handle: Handle<T>) -> Option<&V> {
        self.data.get(handle.index()).and_then(|v| v.as_ref())
    }

    /// Returns a mutable reference to the value attached to the handle.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut V> {
        self.data.get_mut(handle.index()).and_then(|v| v.as_mut())
    }

    /// Returns `true` if the handle has an attached value.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Iterates over `(handle, &value)` pairs in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &V)> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (Handle::new(i as u32), v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_append_and_access() {
        let mut arena = Arena::new();
        let h0 = arena.append("hello");
        let h1 = arena.append("world");
        assert_eq!(arena[h0], "hello");
        assert_eq!(arena[h1], "world");
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn arena_iter() {
        let mut arena = Arena::new();
        arena.append(10);
        arena.append(20);
        arena.append(30);
        let items: Vec<_> = arena.iter().map(|(h, &v)| (h.index(), v)).collect();
        assert_eq!(items, vec![(0, 10), (1, 20), (2, 30)]);
    }

    #[test]
    fn arena_try_get() {
        let mut arena = Arena::new();
        let h0 = arena.append(42);
        assert_eq!(arena.try_get(h0), Some(&42));
        assert_eq!(arena.try_get(Handle::new(99)), None);
    }

    #[test]
    fn handle_ordering() {
        let h0: Handle<u32> = Handle::new(0);
        let h1: Handle<u32> = Handle::new(1);
        assert!(h0 < h1);
        assert_eq!(h0, h0);
    }

    #[test]
    fn handle_map_insert_and_get() {
        let mut map: HandleMap<u32, &str> = HandleMap::new();
        let h0: Handle<u32> = Handle::new(0);
        let h5: Handle<u32> = Handle::new(5);
        assert!(map.insert(h5, "five").is_none());
        assert_eq!(map.get(h5), Some(&"five"));
        assert_eq!(map.get(h0), None);
        assert!(!map.contains(h0));
        assert_eq!(map.insert(h5, "FIVE"), Some("five"));
    }

    #[test]
    fn handle_map_iter_in_order() {
        let mut map: HandleMap<u32, i32> = HandleMap::new();
        map.insert(Handle::new(3), 30);
        map.insert(Handle::new(1), 10);
        let items: Vec<_> = map.iter().map(|(h, &v)| (h.index(), v)).collect();
        assert_eq!(items, vec![(1, 10), (3, 30)]);
    }
}
