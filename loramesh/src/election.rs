//! Coordinator election and join acceptance policies.
//!
//! The node asks its `ElectionPolicy` two questions: whether to nominate
//! itself as coordinator after hearing a beacon (or before sending its own),
//! and whether to accept a node asking to join below it. Randomness comes
//! from the radio so simulations stay reproducible.

use crate::types::DeviceRole;

/// Fixed-point unit for probabilities.
pub const PROBABILITY_SCALE: u32 = 1024;

/// Distance (position units) beyond which the distance penalty stops growing.
pub const FAR_DISTANCE: u32 = 10_000;

/// Everything a policy may weigh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectionContext {
    pub role: DeviceRole,
    pub rank: u8,
    pub children: usize,
    pub capacity: usize,
    /// The beacon that triggered the decision names a coordinator.
    pub coordinator_known: bool,
    /// Rank of the announcing neighbour, `None` for our own beacon.
    pub neighbor_rank: Option<u8>,
    /// Distance to the announcing neighbour, when both positions are known.
    pub distance: Option<u32>,
    pub random: u32,
}

pub trait ElectionPolicy {
    /// Whether this node should claim the coordinator role.
    fn nominate(&self, ctx: &ElectionContext) -> bool;

    /// Whether this node should take on another child.
    fn accept(&self, ctx: &ElectionContext) -> bool;
}

/// Rank- and distance-weighted election.
///
/// Self-nomination succeeds with probability `(rank + 1) / 16`, scaled
/// linearly from 1.0 at distance 0 down to 0.25 at `FAR_DISTANCE`. Against
/// an announced coordinator only a higher-ranked node tries at all.
/// Unknown distance carries no penalty.
#[derive(Clone, Copy, Debug, Default)]
pub struct WeightedElection;

impl WeightedElection {
    fn distance_scale(distance: Option<u32>) -> u32 {
        let Some(d) = distance else {
            return PROBABILITY_SCALE;
        };
        let d = d.min(FAR_DISTANCE) as u64;
        let penalty = (PROBABILITY_SCALE as u64 * 3 / 4) * d / FAR_DISTANCE as u64;
        PROBABILITY_SCALE - penalty as u32
    }

    /// Nomination threshold out of `PROBABILITY_SCALE`.
    pub fn nomination_threshold(rank: u8, distance: Option<u32>) -> u32 {
        let rank = rank.min(15) as u32;
        (rank + 1) * Self::distance_scale(distance) / 16
    }
}

fn draw(random: u32, threshold: u32) -> bool {
    random % PROBABILITY_SCALE < threshold
}

impl ElectionPolicy for WeightedElection {
    fn nominate(&self, ctx: &ElectionContext) -> bool {
        if ctx.coordinator_known && ctx.neighbor_rank.is_some_and(|r| ctx.rank <= r) {
            return false;
        }
        draw(
            ctx.random,
            Self::nomination_threshold(ctx.rank, ctx.distance),
        )
    }

    fn accept(&self, ctx: &ElectionContext) -> bool {
        if ctx.capacity == 0 || ctx.children >= ctx.capacity {
            return false;
        }
        let free = ctx.capacity - ctx.children;
        if free * 2 >= ctx.capacity {
            return true;
        }
        let threshold = (free as u64 * PROBABILITY_SCALE as u64 / ctx.capacity as u64) as u32;
        draw(ctx.random, threshold)
    }
}

/// Always nominate and always accept.
///
/// Capacity is still enforced by the child registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysElect;

impl ElectionPolicy for AlwaysElect {
    fn nominate(&self, _ctx: &ElectionContext) -> bool {
        true
    }

    fn accept(&self, _ctx: &ElectionContext) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ElectionContext {
        ElectionContext {
            role: DeviceRole::Node,
            rank: 0,
            children: 0,
            capacity: 16,
            coordinator_known: false,
            neighbor_rank: None,
            distance: None,
            random: 0,
        }
    }

    #[test]
    fn test_threshold_grows_with_rank() {
        assert_eq!(WeightedElection::nomination_threshold(0, None), 64);
        assert_eq!(WeightedElection::nomination_threshold(7, None), 512);
        assert_eq!(WeightedElection::nomination_threshold(15, None), 1024);
        // Clamped rank.
        assert_eq!(WeightedElection::nomination_threshold(200, None), 1024);
    }

    #[test]
    fn test_threshold_shrinks_with_distance() {
        assert_eq!(WeightedElection::nomination_threshold(15, Some(0)), 1024);
        assert_eq!(WeightedElection::nomination_threshold(15, Some(5_000)), 640);
        assert_eq!(WeightedElection::nomination_threshold(15, Some(10_000)), 256);
        assert_eq!(WeightedElection::nomination_threshold(15, Some(u32::MAX)), 256);
    }

    #[test]
    fn test_nominate_draw() {
        let policy = WeightedElection;
        let mut c = ctx();
        c.random = 63;
        assert!(policy.nominate(&c));
        c.random = 64;
        assert!(!policy.nominate(&c));
        // Only the low bits take part in the draw.
        c.random = 1024 + 10;
        assert!(policy.nominate(&c));
    }

    #[test]
    fn test_no_challenge_against_higher_rank() {
        let policy = WeightedElection;
        let mut c = ctx();
        c.rank = 15;
        c.coordinator_known = true;
        c.neighbor_rank = Some(15);
        assert!(!policy.nominate(&c));
        c.neighbor_rank = Some(14);
        assert!(policy.nominate(&c));
    }

    #[test]
    fn test_accept_by_free_capacity() {
        let policy = WeightedElection;
        let mut c = ctx();
        c.random = 1023;
        c.children = 8;
        assert!(policy.accept(&c));
        c.children = 12;
        assert!(!policy.accept(&c));
        c.random = 255;
        assert!(policy.accept(&c));
        c.children = 16;
        c.random = 0;
        assert!(!policy.accept(&c));
        c.capacity = 0;
        c.children = 0;
        assert!(!policy.accept(&c));
    }

    #[test]
    fn test_always_elect() {
        let mut c = ctx();
        c.coordinator_known = true;
        c.neighbor_rank = Some(15);
        c.random = u32::MAX;
        assert!(AlwaysElect.nominate(&c));
        assert!(AlwaysElect.accept(&c));
    }
}
