//! Generational slab allocator for timer slots.

use core::marker::PhantomData;
use core::num::NonZeroUsize;

/// Newtype for slab indices to prevent cross-slab misuse.
// Manual Copy/Clone: derive would require T: Copy, but PhantomData is just a marker.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SlabIndex<T>(u32, PhantomData<fn() -> T>);

impl<T> Copy for SlabIndex<T> {}

impl<T> Clone for SlabIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> From<u32> for SlabIndex<T> {
    #[inline]
    fn from(idx: u32) -> Self {
        Self(idx, PhantomData)
    }
}

impl<T> From<SlabIndex<T>> for u32 {
    #[inline]
    fn from(idx: SlabIndex<T>) -> Self {
        idx.0
    }
}

impl<T> From<SlabIndex<T>> for usize {
    #[inline]
    fn from(idx: SlabIndex<T>) -> Self {
        idx.0 as Self
    }
}

/// Slot in the slab.
enum Entry<T> {
    /// Live value with the generation it was allocated under.
    Occupied { value: T, generation: u32 },
    /// Free slot with link to next free.
    Free {
        next: Option<SlabIndex<T>>,
        generation: u32,
    },
}

/// Fixed-capacity slab with intrusive free list.
///
/// Freeing a slot bumps its generation, so `(index, generation)` pairs handed
/// out earlier stop resolving.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<SlabIndex<T>>,
    len: usize,
}

impl<T> Slab<T> {
    /// Creates a slab with given capacity, all slots free.
    ///
    /// # Panics
    ///
    /// Panics if `cap` exceeds `u32::MAX`.
    #[must_use]
    pub fn with_capacity(cap: NonZeroUsize) -> Self {
        let capacity = cap.get();
        assert!(
            u32::try_from(capacity).is_ok(),
            "slab capacity should not exceed u32::MAX"
        );
        let entries = (0..capacity)
            .map(|i| Entry::Free {
                // In range: capacity <= u32::MAX checked above.
                next: (i + 1 < capacity).then(|| SlabIndex::from((i + 1) as u32)),
                generation: 0,
            })
            .collect();
        Self {
            entries,
            free_head: Some(SlabIndex::from(0u32)),
            len: 0,
        }
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing is allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocates a slot for `value`, returning its index and generation.
    ///
    /// Returns `None` when the slab is full.
    pub fn alloc(&mut self, value: T) -> Option<(SlabIndex<T>, u32)> {
        let head = self.free_head?;
        let (next_free, generation) = match &self.entries[usize::from(head)] {
            Entry::Free { next, generation } => (*next, *generation),
            Entry::Occupied { .. } => unreachable!("free_head must point to free slot"),
        };
        self.free_head = next_free;
        self.entries[usize::from(head)] = Entry::Occupied { value, generation };
        self.len += 1;
        Some((head, generation))
    }

    /// Frees the slot if it is occupied under `generation`, returning its value.
    pub fn free(&mut self, idx: SlabIndex<T>, generation: u32) -> Option<T> {
        let slot = self.entries.get_mut(usize::from(idx))?;
        match &*slot {
            Entry::Occupied { generation: g, .. } if *g == generation => {}
            _ => return None,
        }
        let old = core::mem::replace(
            slot,
            Entry::Free {
                next: self.free_head,
                generation: generation.wrapping_add(1),
            },
        );
        self.free_head = Some(idx);
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Gets the value at `idx` if it is occupied under `generation`.
    #[must_use]
    pub fn get(&self, idx: SlabIndex<T>, generation: u32) -> Option<&T> {
        match self.entries.get(usize::from(idx))? {
            Entry::Occupied { value, generation: g } if *g == generation => Some(value),
            _ => None,
        }
    }

    /// Mutable variant of [`Slab::get`].
    pub fn get_mut(&mut self, idx: SlabIndex<T>, generation: u32) -> Option<&mut T> {
        match self.entries.get_mut(usize::from(idx))? {
            Entry::Occupied { value, generation: g } if *g == generation => Some(value),
            _ => None,
        }
    }

    /// Generation of the occupied slot at `idx`.
    #[must_use]
    pub fn generation(&self, idx: SlabIndex<T>) -> Option<u32> {
        match self.entries.get(usize::from(idx))? {
            Entry::Occupied { generation, .. } => Some(*generation),
            Entry::Free { .. } => None,
        }
    }

    /// Gets the value at `idx` regardless of generation (wheel-internal links).
    #[must_use]
    pub fn get_any(&self, idx: SlabIndex<T>) -> Option<&T> {
        match self.entries.get(usize::from(idx))? {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Mutable variant of [`Slab::get_any`].
    pub fn get_any_mut(&mut self, idx: SlabIndex<T>) -> Option<&mut T> {
        match self.entries.get_mut(usize::from(idx))? {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slab(cap: usize) -> Slab<&'static str> {
        Slab::with_capacity(NonZeroUsize::new(cap).unwrap())
    }

    #[test]
    fn alloc_until_full() {
        let mut s = slab(2);
        assert!(s.alloc("a").is_some());
        assert!(s.alloc("b").is_some());
        assert!(s.alloc("c").is_none());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn free_bumps_generation_and_reuses_slot() {
        let mut s = slab(1);
        let (idx, generation) = s.alloc("a").unwrap();
        assert_eq!(s.free(idx, generation), Some("a"));
        assert!(s.is_empty());

        let (idx2, gen2) = s.alloc("b").unwrap();
        assert_eq!(idx, idx2);
        assert_ne!(generation, gen2);
        assert!(s.get(idx, generation).is_none(), "stale generation must not resolve");
        assert_eq!(s.get(idx2, gen2), Some(&"b"));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut s = slab(1);
        let (idx, generation) = s.alloc("a").unwrap();
        assert!(s.free(idx, generation).is_some());
        assert!(s.free(idx, generation).is_none());
        assert_eq!(s.len(), 0);
    }
}
