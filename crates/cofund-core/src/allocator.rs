//! Per-person cost allocation for co-funded resources.
//!
//! Everything here is pure integer arithmetic over minor units, so the same pledge
//! vector always yields the same allocation. The pricing view calls [`allocate`] on
//! every read.

use crate::error::CofundError;
use serde::{Deserialize, Serialize};

/// Which rule produced an allocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllocationBranch {
    /// No pledges yet.
    Empty,
    /// Headcount reached `max_people`; everyone pays the floor.
    Saturated,
    /// Pledges do not cover the target; everyone pays what they pledged.
    UnderFunded,
    /// Excess is shaved off proportionally above the floor.
    Proportional,
    /// Excess exceeds what can be shaved; eligible pledgers clamp to the floor and the
    /// unabsorbed excess is left in place.
    FloorClamped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub optimized_costs: Vec<u64>,
    pub is_accepting_pledges: bool,
    pub max_people: u64,
    pub branch: AllocationBranch,
}

impl Allocation {
    pub fn total(&self) -> u64 {
        self.optimized_costs.iter().sum()
    }
}

/// Compute each pledger's actual monthly charge.
///
/// `pledges` are minor-unit amounts in a caller-defined stable order; the returned
/// `optimized_costs` line up index by index.
pub fn allocate(
    pledges: &[u64],
    target_cost: u64,
    min_cost_per_person: u64,
) -> Result<Allocation, CofundError> {
    if target_cost == 0 {
        return Err(CofundError::Validation(
            "target cost must be positive".to_string(),
        ));
    }
    if min_cost_per_person == 0 {
        return Err(CofundError::Validation(
            "minimum cost per person must be positive".to_string(),
        ));
    }

    let max_people = target_cost / min_cost_per_person;

    if pledges.is_empty() {
        return Ok(Allocation {
            optimized_costs: Vec::new(),
            is_accepting_pledges: true,
            max_people,
            branch: AllocationBranch::Empty,
        });
    }

    let count = pledges.len() as u64;
    if count >= max_people {
        return Ok(Allocation {
            optimized_costs: vec![min_cost_per_person; pledges.len()],
            is_accepting_pledges: false,
            max_people,
            branch: AllocationBranch::Saturated,
        });
    }

    let sum: u128 = pledges.iter().map(|amount| *amount as u128).sum();
    let target = target_cost as u128;
    if sum < target {
        return Ok(Allocation {
            optimized_costs: pledges.to_vec(),
            is_accepting_pledges: true,
            max_people,
            branch: AllocationBranch::UnderFunded,
        });
    }

    let (optimized_costs, branch) = redistribute(pledges, target_cost, min_cost_per_person);

    Ok(Allocation {
        optimized_costs,
        is_accepting_pledges: count < max_people,
        max_people,
        branch,
    })
}

/// Step applied once pledges cover the target and headcount has slack.
///
/// When the excess is larger than the headroom above the floor, every eligible pledger
/// is clamped to the floor and the rest of the excess stays in the charges, so the
/// total ends at `target + (excess - headroom)`. With every pledge at or above the
/// floor this cannot happen while `count < max_people`.
fn redistribute(pledges: &[u64], target_cost: u64, floor: u64) -> (Vec<u64>, AllocationBranch) {
    let sum: u128 = pledges.iter().map(|amount| *amount as u128).sum();
    let excess = sum.saturating_sub(target_cost as u128);
    let total_reducible: u128 = pledges
        .iter()
        .filter(|amount| **amount > floor)
        .map(|amount| (*amount - floor) as u128)
        .sum();

    if excess <= total_reducible {
        (
            reduce_proportionally(pledges, floor, excess, total_reducible),
            AllocationBranch::Proportional,
        )
    } else {
        let clamped = pledges
            .iter()
            .map(|amount| (*amount).min(floor))
            .collect();
        (clamped, AllocationBranch::FloorClamped)
    }
}

/// Display savings for one pledger.
pub fn savings(pledged_minor: u64, optimized_minor: u64) -> u64 {
    pledged_minor.saturating_sub(optimized_minor)
}

/// Largest-remainder apportionment of `excess` over the reducible headroom.
///
/// Each eligible pledger first takes `floor(headroom * excess / total)`; the few
/// remaining units go to the largest remainders, ties resolved by position.
fn reduce_proportionally(pledges: &[u64], floor: u64, excess: u128, total: u128) -> Vec<u64> {
    if excess == 0 || total == 0 {
        return pledges.to_vec();
    }

    let mut reductions = vec![0_u128; pledges.len()];
    let mut remainders: Vec<(u128, usize)> = Vec::new();
    let mut assigned = 0_u128;

    for (idx, amount) in pledges.iter().enumerate() {
        if *amount <= floor {
            continue;
        }
        let headroom = (*amount - floor) as u128;
        let numerator = headroom * excess;
        reductions[idx] = numerator / total;
        assigned += reductions[idx];
        remainders.push((numerator % total, idx));
    }

    // Sort by remainder descending, then position ascending.
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    let leftover = (excess - assigned) as usize;
    for (_, idx) in remainders.into_iter().take(leftover) {
        reductions[idx] += 1;
    }

    pledges
        .iter()
        .zip(reductions)
        .map(|(amount, reduction)| amount - reduction as u64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_pledges_accept() {
        let allocation = allocate(&[], 10_000, 200).unwrap();
        assert!(allocation.optimized_costs.is_empty());
        assert!(allocation.is_accepting_pledges);
        assert_eq!(allocation.max_people, 50);
        assert_eq!(allocation.branch, AllocationBranch::Empty);
    }

    #[test]
    fn under_funded_pledges_pay_what_they_pledged() {
        let allocation = allocate(&[1_000, 2_000, 3_000], 10_000, 200).unwrap();
        assert_eq!(allocation.optimized_costs, vec![1_000, 2_000, 3_000]);
        assert!(allocation.is_accepting_pledges);
        assert_eq!(allocation.branch, AllocationBranch::UnderFunded);
    }

    #[test]
    fn funded_pledges_are_reduced_proportionally() {
        let allocation = allocate(&[1_000, 2_000, 3_000, 5_000], 10_000, 200).unwrap();
        assert_eq!(allocation.optimized_costs, vec![922, 1_824, 2_725, 4_529]);
        assert_eq!(allocation.total(), 10_000);
        assert!(allocation.is_accepting_pledges);
        assert_eq!(allocation.branch, AllocationBranch::Proportional);

        let saved: Vec<u64> = [1_000, 2_000, 3_000, 5_000]
            .iter()
            .zip(&allocation.optimized_costs)
            .map(|(pledged, optimized)| savings(*pledged, *optimized))
            .collect();
        assert_eq!(saved, vec![78, 176, 275, 471]);
    }

    #[test]
    fn floor_pledges_are_untouched_by_redistribution() {
        let allocation = allocate(&[200, 1_000, 1_000], 1_800, 200).unwrap();
        assert_eq!(allocation.optimized_costs[0], 200);
        assert_eq!(allocation.total(), 1_800);
    }

    #[test]
    fn saturated_headcount_clamps_everyone_to_floor() {
        let allocation = allocate(&[5_000, 200, 300], 600, 200).unwrap();
        assert_eq!(allocation.max_people, 3);
        assert_eq!(allocation.optimized_costs, vec![200, 200, 200]);
        assert!(!allocation.is_accepting_pledges);
        assert_eq!(allocation.branch, AllocationBranch::Saturated);
    }

    #[test]
    fn excess_beyond_reducible_headroom_clamps_eligible_to_floor() {
        // Sub-floor pledges leave only 100 of headroom against an excess of 150.
        let (costs, branch) = redistribute(&[50, 50, 300], 250, 200);
        assert_eq!(branch, AllocationBranch::FloorClamped);
        assert_eq!(costs, vec![50, 50, 200]);
        // 250 + (150 - 100): the unabsorbed part of the excess stays in the charges.
        assert_eq!(costs.iter().sum::<u64>(), 300);
    }

    #[test]
    fn floor_clamp_is_unreachable_with_headcount_slack() {
        // Same pledges through the public entry point saturate first.
        let allocation = allocate(&[50, 50, 300], 250, 200).unwrap();
        assert_eq!(allocation.branch, AllocationBranch::Saturated);
        assert_eq!(allocation.optimized_costs, vec![200, 200, 200]);

        let allocation = allocate(&[10, 400], 300, 100).unwrap();
        assert_eq!(allocation.branch, AllocationBranch::Proportional);
        assert_eq!(allocation.total(), 300);
        assert!(allocation.is_accepting_pledges);
    }

    #[test]
    fn exact_target_needs_no_reduction() {
        let allocation = allocate(&[400, 600], 1_000, 100).unwrap();
        assert_eq!(allocation.optimized_costs, vec![400, 600]);
        assert_eq!(allocation.branch, AllocationBranch::Proportional);
    }

    #[test]
    fn rejects_zero_parameters() {
        assert!(matches!(
            allocate(&[100], 0, 10),
            Err(CofundError::Validation(_))
        ));
        assert!(matches!(
            allocate(&[100], 100, 0),
            Err(CofundError::Validation(_))
        ));
    }

    #[test]
    fn allocation_is_repeatable() {
        let pledges = [1_333, 777, 4_001, 250, 999];
        let first = allocate(&pledges, 5_000, 100).unwrap();
        for _ in 0..10 {
            assert_eq!(allocate(&pledges, 5_000, 100).unwrap(), first);
        }
    }

    // Target is independent of the floor, and headcount may run past `max_people`
    // the way concurrent settlements could if nothing upstream held the line.
    fn valid_inputs() -> impl Strategy<Value = (Vec<u64>, u64, u64)> {
        (1_u64..500, 1_u64..200)
            .prop_flat_map(|(floor, span)| (Just(floor), floor..=floor * span))
            .prop_flat_map(|(floor, target)| {
                let max_people = (target / floor) as usize;
                (
                    proptest::collection::vec(floor..floor * 40, 0..=max_people * 2 + 2),
                    Just(target),
                    Just(floor),
                )
            })
    }

    proptest! {
        // The ledger never completes more than `max_people` pledges; within that
        // headcount the charged total never exceeds the target.
        #[test]
        fn property_never_creates_money((pledges, target, floor) in valid_inputs()) {
            let allocation = allocate(&pledges, target, floor).unwrap();
            let sum: u64 = pledges.iter().sum();
            if pledges.len() as u64 <= allocation.max_people && sum >= target {
                prop_assert!(allocation.total() <= target);
            }
        }

        #[test]
        fn property_past_max_people_charges_every_floor((pledges, target, floor) in valid_inputs()) {
            let allocation = allocate(&pledges, target, floor).unwrap();
            if pledges.len() as u64 > allocation.max_people {
                prop_assert_eq!(allocation.branch, AllocationBranch::Saturated);
                prop_assert_eq!(allocation.total(), pledges.len() as u64 * floor);
                prop_assert!(allocation.total() > target);
            }
        }

        #[test]
        fn property_under_funded_is_identity((pledges, target, floor) in valid_inputs()) {
            let allocation = allocate(&pledges, target, floor).unwrap();
            let sum: u64 = pledges.iter().sum();
            if (pledges.len() as u64) < allocation.max_people && sum < target {
                prop_assert_eq!(&allocation.optimized_costs, &pledges);
            }
        }

        #[test]
        fn property_saturation_clamps_to_floor((pledges, target, floor) in valid_inputs()) {
            let allocation = allocate(&pledges, target, floor).unwrap();
            if !pledges.is_empty() && pledges.len() as u64 >= allocation.max_people {
                prop_assert!(allocation.optimized_costs.iter().all(|cost| *cost == floor));
            }
        }

        #[test]
        fn property_charges_stay_between_floor_and_pledge((pledges, target, floor) in valid_inputs()) {
            let allocation = allocate(&pledges, target, floor).unwrap();
            for (pledged, optimized) in pledges.iter().zip(&allocation.optimized_costs) {
                prop_assert!(*optimized >= floor);
                prop_assert!(*optimized <= (*pledged).max(floor));
            }
        }
    }
}
