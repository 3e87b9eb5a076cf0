//! Weighted random selection among the variants of a canary trigger.
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanaryError {
    #[error("a weighted trigger needs at least one function")]
    Empty,
    #[error("function '{0}' has weight 0")]
    ZeroWeight(String),
    #[error("total weight overflows")]
    Overflow,
}

/// Variants with precomputed prefix sums. Sums are strictly increasing and the
/// last one is the total weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedVariants {
    names: Vec<String>,
    prefix_sums: Vec<u64>,
}

impl WeightedVariants {
    pub fn new<I, S>(variants: I) -> Result<Self, CanaryError>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut names = Vec::new();
        let mut prefix_sums = Vec::new();
        let mut total: u64 = 0;

        for (name, weight) in variants {
            let name = name.into();
            if weight == 0 {
                return Err(CanaryError::ZeroWeight(name));
            }
            total = total
                .checked_add(u64::from(weight))
                .ok_or(CanaryError::Overflow)?;
            names.push(name);
            prefix_sums.push(total);
        }

        if names.is_empty() {
            return Err(CanaryError::Empty);
        }
        Ok(Self { names, prefix_sums })
    }

    pub fn total_weight(&self) -> u64 {
        self.prefix_sums.last().copied().unwrap_or(0)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Index of the first variant whose prefix sum is `>= draw`. Draws above the
    /// total clamp to the last variant.
    pub fn index_of(&self, draw: u64) -> usize {
        self.prefix_sums
            .partition_point(|&sum| sum < draw)
            .min(self.names.len() - 1)
    }

    pub fn select(&self, draw: u64) -> &str {
        &self.names[self.index_of(draw)]
    }

    /// Draws uniformly from `[0, total]` and returns the matching index.
    pub fn pick_index_with<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let draw = rng.random_range(0..=self.total_weight());
        self.index_of(draw)
    }

    pub fn pick_index(&self) -> usize {
        self.pick_index_with(&mut rand::rng())
    }

    pub fn pick(&self) -> &str {
        &self.names[self.pick_index()]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn canary() -> WeightedVariants {
        WeightedVariants::new([("v1", 10), ("v2", 20), ("v3", 70)]).unwrap()
    }

    #[test]
    fn selects_smallest_prefix_at_or_above_draw() {
        let variants = canary();
        assert_eq!(variants.total_weight(), 100);
        assert_eq!(variants.select(0), "v1");
        assert_eq!(variants.select(5), "v1");
        assert_eq!(variants.select(10), "v1");
        assert_eq!(variants.select(11), "v2");
        assert_eq!(variants.select(15), "v2");
        assert_eq!(variants.select(30), "v2");
        assert_eq!(variants.select(31), "v3");
        assert_eq!(variants.select(100), "v3");
    }

    #[test]
    fn frequencies_follow_weights() {
        let variants = canary();
        let mut rng = StdRng::seed_from_u64(7);
        let draws = 100_000;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for _ in 0..draws {
            *counts
                .entry(variants.names()[variants.pick_index_with(&mut rng)].as_str())
                .or_default() += 1;
        }

        for (name, weight) in [("v1", 0.10), ("v2", 0.20), ("v3", 0.70)] {
            let observed = counts[name] as f64 / draws as f64;
            assert!(
                (observed - weight).abs() < 0.02,
                "{name}: observed {observed}, expected {weight}"
            );
        }
    }

    #[test]
    fn rejects_degenerate_input() {
        assert_eq!(
            WeightedVariants::new(Vec::<(String, u32)>::new()),
            Err(CanaryError::Empty)
        );
        assert_eq!(
            WeightedVariants::new([("v1", 10), ("v2", 0)]),
            Err(CanaryError::ZeroWeight("v2".into()))
        );
    }

    #[test]
    fn single_variant_always_wins() {
        let variants = WeightedVariants::new([("only", 1)]).unwrap();
        for _ in 0..32 {
            assert_eq!(variants.pick(), "only");
        }
    }
}
