//! Sharding strategies.
//!
//! A strategy maps the sorted list of available instances and the item count
//! to an assignment. Every strategy is deterministic and complete: the same
//! inputs always give the same map, and every item in `0..total` lands on
//! exactly one instance.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ElasticError, Result};
use crate::topology::JobInstance;

pub type ShardingAssignment = BTreeMap<JobInstance, Vec<u32>>;

pub trait JobShardingStrategy: Send + Sync {
    /// `instances` is sorted by instance id.
    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> ShardingAssignment;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingStrategyType {
    AverageAllocation,
    Odevity,
    RoundRobin,
}

impl ShardingStrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardingStrategyType::AverageAllocation => "AVG_ALLOCATION",
            ShardingStrategyType::Odevity => "ODEVITY",
            ShardingStrategyType::RoundRobin => "ROUND_ROBIN",
        }
    }

    pub fn all() -> [ShardingStrategyType; 3] {
        [
            ShardingStrategyType::AverageAllocation,
            ShardingStrategyType::Odevity,
            ShardingStrategyType::RoundRobin,
        ]
    }

    pub fn create(&self) -> Box<dyn JobShardingStrategy> {
        match self {
            ShardingStrategyType::AverageAllocation => Box::new(AverageAllocationStrategy),
            ShardingStrategyType::Odevity => Box::new(OdevitySortByNameStrategy),
            ShardingStrategyType::RoundRobin => Box::new(RoundRobinByNameHashStrategy),
        }
    }
}

impl fmt::Display for ShardingStrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardingStrategyType {
    type Err = ElasticError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Ok(ShardingStrategyType::AverageAllocation);
        }
        Self::all()
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ElasticError::UnknownShardingStrategy(s.to_string()))
    }
}

/// Contiguous, even split: each instance gets `total / n` items and the
/// first `total % n` instances get one extra.
pub struct AverageAllocationStrategy;

impl JobShardingStrategy for AverageAllocationStrategy {
    fn sharding(&self, instances: &[JobInstance], _job_name: &str, total: u32) -> ShardingAssignment {
        let mut result = ShardingAssignment::new();
        if instances.is_empty() {
            return result;
        }
        let count = instances.len() as u32;
        let base = total / count;
        let remainder = total % count;
        let mut next = 0;
        for (index, instance) in instances.iter().enumerate() {
            let size = base + u32::from((index as u32) < remainder);
            result.insert(instance.clone(), (next..next + size).collect());
            next += size;
        }
        result
    }

    fn name(&self) -> &'static str {
        ShardingStrategyType::AverageAllocation.as_str()
    }
}

/// Average allocation over the instance list, reversed when the job name
/// hashes to an even number, so jobs with few items do not all pile onto
/// the same instances.
pub struct OdevitySortByNameStrategy;

impl JobShardingStrategy for OdevitySortByNameStrategy {
    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> ShardingAssignment {
        let mut ordered = instances.to_vec();
        if name_hash(job_name) % 2 == 0 {
            ordered.reverse();
        }
        AverageAllocationStrategy.sharding(&ordered, job_name, total)
    }

    fn name(&self) -> &'static str {
        ShardingStrategyType::Odevity.as_str()
    }
}

/// Average allocation over the instance list rotated by the job name hash.
pub struct RoundRobinByNameHashStrategy;

impl JobShardingStrategy for RoundRobinByNameHashStrategy {
    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> ShardingAssignment {
        if instances.is_empty() {
            return ShardingAssignment::new();
        }
        let offset = (name_hash(job_name).unsigned_abs() as usize) % instances.len();
        let mut rotated = instances.to_vec();
        rotated.rotate_left(offset);
        AverageAllocationStrategy.sharding(&rotated, job_name, total)
    }

    fn name(&self) -> &'static str {
        ShardingStrategyType::RoundRobin.as_str()
    }
}

/// Stable 32-bit string hash (`h = 31 * h + c` over UTF-16 code units) so
/// every process computes the same ordering for a job name.
pub fn name_hash(name: &str) -> i32 {
    name.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances(n: usize) -> Vec<JobInstance> {
        (0..n)
            .map(|i| JobInstance::with_discriminator("host", i))
            .collect()
    }

    fn items_of(assignment: &ShardingAssignment, instance: &JobInstance) -> Vec<u32> {
        assignment.get(instance).cloned().unwrap_or_default()
    }

    #[test]
    fn average_allocation_divides_evenly() {
        let list = instances(3);
        let result = AverageAllocationStrategy.sharding(&list, "job", 9);
        assert_eq!(items_of(&result, &list[0]), vec![0, 1, 2]);
        assert_eq!(items_of(&result, &list[1]), vec![3, 4, 5]);
        assert_eq!(items_of(&result, &list[2]), vec![6, 7, 8]);
    }

    #[test]
    fn average_allocation_gives_remainder_to_first_instances() {
        let list = instances(3);
        let result = AverageAllocationStrategy.sharding(&list, "job", 8);
        assert_eq!(items_of(&result, &list[0]), vec![0, 1, 2]);
        assert_eq!(items_of(&result, &list[1]), vec![3, 4, 5]);
        assert_eq!(items_of(&result, &list[2]), vec![6, 7]);
    }

    #[test]
    fn average_allocation_with_more_instances_than_items() {
        let list = instances(3);
        let result = AverageAllocationStrategy.sharding(&list, "job", 2);
        assert_eq!(items_of(&result, &list[0]), vec![0]);
        assert_eq!(items_of(&result, &list[1]), vec![1]);
        assert!(items_of(&result, &list[2]).is_empty());
    }

    #[test]
    fn average_allocation_without_instances_is_empty() {
        assert!(AverageAllocationStrategy.sharding(&[], "job", 4).is_empty());
    }

    #[test]
    fn every_strategy_is_complete_and_deterministic() {
        for strategy_type in ShardingStrategyType::all() {
            let strategy = strategy_type.create();
            for n in 1..=5 {
                for total in 1..=12u32 {
                    let list = instances(n);
                    let first = strategy.sharding(&list, "order-sync", total);
                    let second = strategy.sharding(&list, "order-sync", total);
                    assert_eq!(first, second, "{} is not deterministic", strategy.name());

                    let mut all: Vec<u32> = first.values().flatten().copied().collect();
                    all.sort_unstable();
                    assert_eq!(
                        all,
                        (0..total).collect::<Vec<_>>(),
                        "{} lost or duplicated items for n={} total={}",
                        strategy.name(),
                        n,
                        total
                    );
                }
            }
        }
    }

    #[test]
    fn odevity_reverses_for_even_hash() {
        let list = instances(2);
        // Pick names by hash parity instead of hard-coding them.
        let even = (0..100).map(|i| format!("job-{}", i)).find(|n| name_hash(n) % 2 == 0).unwrap();
        let odd = (0..100).map(|i| format!("job-{}", i)).find(|n| name_hash(n) % 2 != 0).unwrap();

        let result = OdevitySortByNameStrategy.sharding(&list, &even, 2);
        assert_eq!(items_of(&result, &list[1]), vec![0]);
        let result = OdevitySortByNameStrategy.sharding(&list, &odd, 2);
        assert_eq!(items_of(&result, &list[0]), vec![0]);
    }

    #[test]
    fn round_robin_rotates_by_name_hash() {
        let list = instances(3);
        let name = "order-sync";
        let offset = (name_hash(name).unsigned_abs() as usize) % 3;
        let result = RoundRobinByNameHashStrategy.sharding(&list, name, 3);
        assert_eq!(items_of(&result, &list[offset]), vec![0]);
    }

    #[test]
    fn name_hash_matches_known_values() {
        assert_eq!(name_hash(""), 0);
        assert_eq!(name_hash("a"), 97);
        assert_eq!(name_hash("ab"), 97 * 31 + 98);
    }

    #[test]
    fn strategy_type_parsing() {
        assert_eq!(
            "avg_allocation".parse::<ShardingStrategyType>().unwrap(),
            ShardingStrategyType::AverageAllocation
        );
        assert_eq!(
            "".parse::<ShardingStrategyType>().unwrap(),
            ShardingStrategyType::AverageAllocation
        );
        assert_eq!(
            "ROUND_ROBIN".parse::<ShardingStrategyType>().unwrap(),
            ShardingStrategyType::RoundRobin
        );
        assert!(matches!(
            "RANDOM".parse::<ShardingStrategyType>(),
            Err(ElasticError::UnknownShardingStrategy(_))
        ));
    }
}
