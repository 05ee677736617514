//! Weighted stripe routing table
//!
//! Every stripe draws pseudo-random tickets in proportion to its length.
//! The tickets are sorted on their value and the 32-bit circle is cut into
//! `ROUTING_TABLE_SIZE` equal slices; a slice belongs to the stripe holding
//! the first ticket at or above the slice center.
//!
//! # Properties
//! - Each stripe owns roughly `len / total` of the table
//! - Tickets depend only on the stripe's identity hash, so adding a stripe
//!   moves slots to the new stripe and leaves the others in place
//! - `key_to_stripe` is a pure function of the key and the table

use stripecache_common::{CacheKey, Error, Result, StoreBlocks};
use tracing::debug;

/// Number of slots in the routing table (prime)
pub const ROUTING_TABLE_SIZE: usize = 32707;

/// Slot marker for "no stripe"
pub const EMPTY_SLOT: u16 = 0xFFFF;

/// Store blocks of stripe length per ticket (8 MiB)
pub const TICKET_BLOCKS: u64 = 1024;

/// Low key bits consumed by the directory tag
const KEY_SHIFT: u32 = 12;

/// A stripe taking part in routing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteTarget {
    /// Stripe identity hash
    pub hash_id: CacheKey,
    pub len: StoreBlocks,
}

impl RouteTarget {
    #[must_use]
    pub const fn new(hash_id: CacheKey, len: StoreBlocks) -> Self {
        Self { hash_id, len }
    }

    const fn tickets(&self) -> u64 {
        let n = self.len.count() / TICKET_BLOCKS;
        if n == 0 { 1 } else { n }
    }
}

#[derive(Clone, Copy)]
struct Ticket {
    rval: u32,
    target: u16,
}

/// Linear congruential step used to draw ticket values
const fn next_rand(state: &mut u32) -> u32 {
    *state = state.wrapping_mul(1_103_515_145).wrapping_add(12345);
    *state
}

/// Routing table mapping key buckets to stripe indices
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripeHashTable {
    slots: Box<[u16]>,
    /// Slots each target should own by length
    expected: Vec<u32>,
    /// Slots each target does own
    assigned: Vec<u32>,
}

impl StripeHashTable {
    /// Build the table over `targets`. Indices in the table refer to
    /// positions in `targets`.
    pub fn build(targets: &[RouteTarget]) -> Result<Self> {
        if targets.is_empty() {
            return Err(Error::NoStripes);
        }
        if targets.len() >= usize::from(EMPTY_SLOT) {
            return Err(Error::internal(format!(
                "{} stripes exceed the routing table index range",
                targets.len()
            )));
        }

        let total: u128 = targets.iter().map(|t| u128::from(t.len.count())).sum();
        let mut expected: Vec<u32> = targets
            .iter()
            .map(|t| {
                if total == 0 {
                    0
                } else {
                    (ROUTING_TABLE_SIZE as u128 * u128::from(t.len.count()) / total) as u32
                }
            })
            .collect();
        let used: u64 = expected.iter().map(|&n| u64::from(n)).sum();
        let extra = ROUTING_TABLE_SIZE as u64 - used;
        for i in 0..extra as usize {
            expected[i % targets.len()] += 1;
        }

        let mut tickets = Vec::with_capacity(targets.iter().map(|t| t.tickets() as usize).sum());
        for (i, t) in targets.iter().enumerate() {
            let mut state = t.hash_id.fold() as u32;
            for _ in 0..t.tickets() {
                tickets.push(Ticket {
                    rval: next_rand(&mut state),
                    target: i as u16,
                });
            }
        }
        tickets.sort_unstable_by_key(|t| (t.rval, t.target));

        let width = (1u64 << 32) / ROUTING_TABLE_SIZE as u64;
        let mut slots = vec![EMPTY_SLOT; ROUTING_TABLE_SIZE].into_boxed_slice();
        let mut assigned = vec![0u32; targets.len()];
        let mut i = 0;
        for (j, slot) in slots.iter_mut().enumerate() {
            let pos = width / 2 + j as u64 * width;
            while pos > u64::from(tickets[i].rval) && i < tickets.len() - 1 {
                i += 1;
            }
            *slot = tickets[i].target;
            assigned[usize::from(tickets[i].target)] += 1;
        }

        for (i, (want, got)) in expected.iter().zip(&assigned).enumerate() {
            debug!(stripe = i, expected = want, assigned = got, "routing share");
        }
        Ok(Self {
            slots,
            expected,
            assigned,
        })
    }

    /// Table slot for a key
    #[must_use]
    pub const fn bucket(key: &CacheKey) -> usize {
        ((key.slice32(2) >> KEY_SHIFT) as usize) % ROUTING_TABLE_SIZE
    }

    /// Index of the stripe serving `key`
    #[must_use]
    pub fn key_to_stripe(&self, key: &CacheKey) -> Option<usize> {
        self.slot(Self::bucket(key))
    }

    #[must_use]
    pub fn slot(&self, bucket: usize) -> Option<usize> {
        match self.slots.get(bucket) {
            Some(&EMPTY_SLOT) | None => None,
            Some(&t) => Some(usize::from(t)),
        }
    }

    /// Number of targets the table was built over
    #[must_use]
    pub fn targets(&self) -> usize {
        self.assigned.len()
    }

    #[must_use]
    pub fn expected(&self, target: usize) -> u32 {
        self.expected.get(target).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn assigned(&self, target: usize) -> u32 {
        self.assigned.get(target).copied().unwrap_or(0)
    }

    /// Fraction of the table owned by `target`
    #[must_use]
    pub fn share(&self, target: usize) -> f64 {
        f64::from(self.assigned(target)) / ROUTING_TABLE_SIZE as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn target(name: &str, blocks: u64) -> RouteTarget {
        let hash_id = CacheKey::digest(format!("{name} 16384:{blocks}"));
        RouteTarget::new(hash_id, StoreBlocks::new(blocks))
    }

    #[test]
    fn test_empty_is_rejected() {
        assert!(matches!(StripeHashTable::build(&[]), Err(Error::NoStripes)));
    }

    #[test]
    fn test_single_stripe_owns_everything() {
        let table = StripeHashTable::build(&[target("/dev/sdb", 5)]).unwrap();
        assert_eq!(table.assigned(0) as usize, ROUTING_TABLE_SIZE);
        assert_eq!(table.expected(0) as usize, ROUTING_TABLE_SIZE);
        assert!((0..ROUTING_TABLE_SIZE).all(|b| table.slot(b) == Some(0)));
    }

    #[test]
    fn test_share_follows_length() {
        let lens = [1000u64, 2000, 3000];
        let targets: Vec<_> = lens
            .iter()
            .zip(["/dev/sdb", "/dev/sdc", "/dev/sdd"])
            .map(|(&l, name)| target(name, l * TICKET_BLOCKS))
            .collect();
        let table = StripeHashTable::build(&targets).unwrap();

        let total: u64 = lens.iter().sum();
        let mut sum = 0;
        for (i, &l) in lens.iter().enumerate() {
            let want = l as f64 / total as f64;
            assert!(
                (table.share(i) - want).abs() < 0.02,
                "stripe {i}: share {} want {want}",
                table.share(i)
            );
            sum += table.assigned(i);
        }
        assert_eq!(sum as usize, ROUTING_TABLE_SIZE);
        let expected: u32 = (0..3).map(|i| table.expected(i)).sum();
        assert_eq!(expected as usize, ROUTING_TABLE_SIZE);
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let targets = [target("/dev/sdb", 40_000), target("/dev/sdc", 90_000)];
        let a = StripeHashTable::build(&targets).unwrap();
        let b = StripeHashTable::build(&targets).unwrap();
        assert_eq!(a, b);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let mut bytes = [0u8; 16];
            rng.fill(&mut bytes);
            let key = CacheKey::from_bytes(bytes);
            let hit = a.key_to_stripe(&key);
            assert!(hit.is_some_and(|i| i < 2));
            assert_eq!(hit, a.key_to_stripe(&key));
            assert_eq!(hit, b.key_to_stripe(&key));
        }
    }

    #[test]
    fn test_adding_a_stripe_only_moves_slots_to_it() {
        let targets: Vec<_> = ["/dev/sdb", "/dev/sdc", "/dev/sdd", "/dev/sde"]
            .iter()
            .map(|name| target(name, 1000 * TICKET_BLOCKS))
            .collect();
        let before = StripeHashTable::build(&targets[..3]).unwrap();
        let after = StripeHashTable::build(&targets).unwrap();

        let mut moved = 0;
        for b in 0..ROUTING_TABLE_SIZE {
            if before.slot(b) != after.slot(b) {
                assert_eq!(after.slot(b), Some(3));
                moved += 1;
            }
        }
        assert_eq!(moved, after.assigned(3));
        assert!((after.share(3) - 0.25).abs() < 0.02);
    }

    #[test]
    fn test_bucket_uses_third_word() {
        let mut bytes = [0u8; 16];
        bytes[8..12].copy_from_slice(&(5u32 << KEY_SHIFT).to_le_bytes());
        assert_eq!(StripeHashTable::bucket(&CacheKey::from_bytes(bytes)), 5);

        bytes[8..12].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        assert_eq!(
            StripeHashTable::bucket(&CacheKey::from_bytes(bytes)),
            (0xFFFF_FFFFu32 >> KEY_SHIFT) as usize % ROUTING_TABLE_SIZE
        );
    }
}
