//! A generationally-indexed arena whose values are also threaded onto a doubly linked chain.
//!
//! Functions and instructions both live in one of these: keys stay valid across insertions in the middle of
//! the chain, and a removed value can never be observed through a stale key.

use std::marker::PhantomData;

/// A key that can be used with a [`Chain`].
///
/// Instead of implementing this trait manually, it is recommended to use the [`new_key`](crate::new_key) macro.
pub trait Key: Copy + Eq + Ord + 'static {
    fn new(slot: usize, generation: usize) -> Self;
    fn get_slot(&self) -> usize;
    fn get_generation(&self) -> usize;
}

/// Defines a new key type for use in [`Chain`].
#[macro_export]
macro_rules! new_key {
    ($($(#[doc = $doc:expr])? $vis:vis struct $name:ident;)*) => {$(
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $(#[doc = $doc])?
        $vis struct $name(usize, usize);
        impl $crate::arena::Key for $name {
            fn new(slot: usize, generation: usize) -> Self { Self(slot, generation) }
            fn get_slot(&self) -> usize { self.0 }
            fn get_generation(&self) -> usize { self.1 }
        }
    )*}
}

#[derive(Clone)]
struct Slot<K, T> {
    value: Option<T>,
    generation: usize,
    prev: Option<K>,
    next: Option<K>,
}

/// An ordered chain of values addressed by generational keys.
#[derive(Clone)]
pub struct Chain<K: Key, T> {
    slots: Vec<Slot<K, T>>,
    empty_slots: Vec<usize>,
    num_values: usize,
    head: Option<K>,
    tail: Option<K>,
    _key: PhantomData<K>,
}
impl<K: Key, T> Default for Chain<K, T> {
    fn default() -> Self {
        Self::new()
    }
}
impl<K: Key, T> Chain<K, T> {
    /// Creates a new empty chain.
    pub fn new() -> Self {
        Chain {
            slots: vec![],
            empty_slots: vec![],
            num_values: 0,
            head: None,
            tail: None,
            _key: PhantomData,
        }
    }
    #[cfg(test)]
    fn invariant(&self) -> bool {
        self.num_values == self.slots.iter().filter(|x| x.value.is_some()).count()
        &&
        self.num_values + self.empty_slots.len() == self.slots.len()
        &&
        self.keys().count() == self.num_values
    }
    fn slot(&self, key: K) -> Option<&Slot<K, T>> {
        let slot = self.slots.get(key.get_slot())?;
        if slot.generation == key.get_generation() && slot.value.is_some() { Some(slot) } else { None }
    }
    fn slot_mut(&mut self, key: K) -> Option<&mut Slot<K, T>> {
        let slot = self.slots.get_mut(key.get_slot())?;
        if slot.generation == key.get_generation() && slot.value.is_some() { Some(slot) } else { None }
    }
    fn allocate(&mut self, value: T, prev: Option<K>, next: Option<K>) -> K {
        self.num_values += 1;
        match self.empty_slots.pop() {
            Some(slot) => {
                debug_assert!(self.slots[slot].value.is_none());
                let entry = &mut self.slots[slot];
                entry.value = Some(value);
                entry.prev = prev;
                entry.next = next;
                K::new(slot, entry.generation)
            }
            None => {
                let slot = self.slots.len();
                self.slots.push(Slot { value: Some(value), generation: 0, prev, next });
                K::new(slot, 0)
            }
        }
    }
    /// Appends a value to the end of the chain and returns a new key that references it.
    pub fn push_back(&mut self, value: T) -> K {
        let prev = self.tail;
        let key = self.allocate(value, prev, None);
        match prev {
            Some(prev) => if let Some(slot) = self.slot_mut(prev) { slot.next = Some(key) },
            None => self.head = Some(key),
        }
        self.tail = Some(key);

        #[cfg(test)] assert!(self.invariant());
        key
    }
    /// Inserts a value directly after `after` in the chain.
    /// Returns [`None`] (and drops nothing) if `after` is not a live key.
    pub fn insert_after(&mut self, after: K, value: T) -> Option<K> {
        let next = self.slot(after)?.next;
        let key = self.allocate(value, Some(after), next);
        if let Some(slot) = self.slot_mut(after) { slot.next = Some(key) }
        match next {
            Some(next) => if let Some(slot) = self.slot_mut(next) { slot.prev = Some(key) },
            None => self.tail = Some(key),
        }

        #[cfg(test)] assert!(self.invariant());
        Some(key)
    }
    /// Unlinks a value from the chain and returns it (if it existed).
    /// It is guaranteed that all future accesses with the removed key will return [`None`].
    pub fn remove(&mut self, key: K) -> Option<T> {
        let (prev, next) = {
            let slot = self.slot(key)?;
            (slot.prev, slot.next)
        };
        match prev {
            Some(prev) => if let Some(slot) = self.slot_mut(prev) { slot.next = next },
            None => self.head = next,
        }
        match next {
            Some(next) => if let Some(slot) = self.slot_mut(next) { slot.prev = prev },
            None => self.tail = prev,
        }

        let slot = &mut self.slots[key.get_slot()];
        let res = slot.value.take();
        slot.generation += 1;
        slot.prev = None;
        slot.next = None;
        self.num_values -= 1;
        self.empty_slots.push(key.get_slot());

        #[cfg(test)] assert!(self.invariant());
        res
    }
    /// Get a reference to a value in the chain.
    pub fn get(&self, key: K) -> Option<&T> {
        self.slot(key)?.value.as_ref()
    }
    /// Get a mutable reference to a value in the chain.
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.slot_mut(key)?.value.as_mut()
    }
    pub fn first(&self) -> Option<K> {
        self.head
    }
    pub fn last(&self) -> Option<K> {
        self.tail
    }
    /// Gets the key following `key` in chain order.
    pub fn next(&self, key: K) -> Option<K> {
        self.slot(key)?.next
    }
    /// Gets the key preceding `key` in chain order.
    pub fn prev(&self, key: K) -> Option<K> {
        self.slot(key)?.prev
    }
    /// Get the number of values stored in the chain.
    pub fn len(&self) -> usize {
        self.num_values
    }
    /// Checks if the chain is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Iterates over the keys in chain order.
    pub fn keys(&self) -> Keys<'_, K, T> {
        Keys { chain: self, cursor: self.head }
    }
    /// Iterates over the keys and values in chain order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.keys().filter_map(move |key| Some((key, self.get(key)?)))
    }
}

pub struct Keys<'a, K: Key, T> {
    chain: &'a Chain<K, T>,
    cursor: Option<K>,
}
impl<K: Key, T> Iterator for Keys<'_, K, T> {
    type Item = K;
    fn next(&mut self) -> Option<K> {
        let key = self.cursor?;
        self.cursor = self.chain.next(key);
        Some(key)
    }
}

#[test]
fn test_chain() {
    new_key! {
        struct TestKey;
    }
    fn values(chain: &Chain<TestKey, i32>) -> Vec<i32> {
        chain.iter().map(|(_, v)| *v).collect()
    }

    let mut chain: Chain<TestKey, i32> = Chain::new();
    assert!(chain.is_empty());
    assert_eq!(chain.first(), None);

    let a = chain.push_back(1);
    let b = chain.push_back(2);
    let c = chain.push_back(3);
    assert_eq!(values(&chain), [1, 2, 3]);
    assert_eq!((chain.first(), chain.last()), (Some(a), Some(c)));

    let d = chain.insert_after(a, 10).unwrap();
    assert_eq!(values(&chain), [1, 10, 2, 3]);
    assert_eq!(chain.next(a), Some(d));
    assert_eq!(chain.prev(b), Some(d));

    let e = chain.insert_after(c, 20).unwrap();
    assert_eq!(chain.last(), Some(e));

    assert_eq!(chain.remove(b), Some(2));
    assert_eq!(chain.remove(b), None);
    assert!(chain.get(b).is_none());
    assert_eq!(values(&chain), [1, 10, 3, 20]);

    assert_eq!(chain.remove(a), Some(1));
    assert_eq!(chain.first(), Some(d));
    assert_eq!(chain.remove(e), Some(20));
    assert_eq!(chain.last(), Some(c));
    assert_eq!(values(&chain), [10, 3]);
    assert!(chain.insert_after(a, 99).is_none());

    let f = chain.push_back(4);
    assert_eq!(f.0, e.0);
    assert_ne!(f.1, e.1);
    assert!(chain.get(e).is_none());
    *chain.get_mut(f).unwrap() += 1;
    assert_eq!(values(&chain), [10, 3, 5]);
    assert_eq!(chain.len(), 3);

    for key in [d, c, f] {
        assert!(chain.remove(key).is_some());
    }
    assert!(chain.is_empty());
    assert_eq!((chain.first(), chain.last()), (None, None));

    let mut keys = vec![];
    for i in 0..64 {
        keys.push((chain.push_back(i), i));
    }
    for (key, i) in keys.iter().copied().filter(|(_, i)| i % 3 == 0) {
        assert_eq!(chain.remove(key), Some(i));
    }
    assert_eq!(values(&chain), (0..64).filter(|i| i % 3 != 0).collect::<Vec<_>>());
}
