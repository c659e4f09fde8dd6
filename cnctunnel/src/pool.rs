//! Identifier pool: the free half of the 16-bit slot space.
//!
//! Identifiers are handed out in a shuffled order so a client cannot predict
//! which identifiers its peers (or other games) were given. The pool itself is
//! a plain container; it is only ever mutated inside the admission critical
//! section together with the [`ClientRegistry`](crate::registry::ClientRegistry),
//! which is what keeps an identifier in exactly one of the two places.

use std::collections::VecDeque;

use rand::Rng;
use rand::seq::SliceRandom;

/// A relay slot identifier.
pub type SlotId = i16;

/// Number of identifiers in the full slot space.
pub const SLOT_SPACE: usize = 1 << 16;

/// Pool of free slot identifiers.
#[derive(Debug, Clone, Default)]
pub struct IdentifierPool {
    free: VecDeque<SlotId>,
}

impl IdentifierPool {
    /// Every identifier in `i16::MIN..=i16::MAX`, uniformly shuffled.
    pub fn shuffled() -> Self {
        Self::shuffled_with(&mut rand::thread_rng())
    }

    /// Like [`shuffled`](Self::shuffled) with a caller-supplied RNG.
    pub fn shuffled_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut all: Vec<SlotId> = (SlotId::MIN..=SlotId::MAX).collect();
        all.shuffle(rng);
        Self { free: all.into() }
    }

    /// Pool holding exactly `ids`, in the given order.
    pub fn from_ids(ids: impl IntoIterator<Item = SlotId>) -> Self {
        Self {
            free: ids.into_iter().collect(),
        }
    }

    pub fn take(&mut self) -> Option<SlotId> {
        self.free.pop_front()
    }

    /// Take `n` identifiers as one group, or none at all.
    pub fn take_many(&mut self, n: usize) -> Option<Vec<SlotId>> {
        if n > self.free.len() {
            return None;
        }
        Some(self.free.drain(..n).collect())
    }

    pub fn give(&mut self, id: SlotId) {
        self.free.push_back(id);
    }

    pub fn give_all(&mut self, ids: impl IntoIterator<Item = SlotId>) {
        self.free.extend(ids);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: SlotId) -> bool {
        self.free.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn shuffled_pool_covers_entire_space_once() {
        let pool = IdentifierPool::shuffled();
        assert_eq!(pool.len(), SLOT_SPACE);

        let unique: HashSet<SlotId> = pool.free.iter().copied().collect();
        assert_eq!(unique.len(), SLOT_SPACE);
        assert!(unique.contains(&SlotId::MIN));
        assert!(unique.contains(&SlotId::MAX));
    }

    #[test]
    fn shuffled_pool_is_not_sequential() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pool = IdentifierPool::shuffled_with(&mut rng);

        let head = pool.take_many(16).unwrap();
        let sequential: Vec<SlotId> = (SlotId::MIN..SlotId::MIN + 16).collect();
        assert_ne!(head, sequential);
    }

    #[test]
    fn take_until_exhausted() {
        let mut pool = IdentifierPool::from_ids([1, 2]);
        assert_eq!(pool.take(), Some(1));
        assert_eq!(pool.take(), Some(2));
        assert_eq!(pool.take(), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn take_many_is_all_or_nothing() {
        let mut pool = IdentifierPool::from_ids([10, 11, 12]);

        assert!(pool.take_many(4).is_none());
        assert_eq!(pool.len(), 3);

        assert_eq!(pool.take_many(3), Some(vec![10, 11, 12]));
        assert!(pool.is_empty());
    }

    #[test]
    fn give_returns_identifier_to_the_back() {
        let mut pool = IdentifierPool::from_ids([1, 2]);
        let id = pool.take().unwrap();
        pool.give(id);

        assert_eq!(pool.len(), 2);
        assert!(pool.contains(1));
        assert_eq!(pool.take(), Some(2));
        assert_eq!(pool.take(), Some(1));
    }
}
