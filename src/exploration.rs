//! Tie-breaking among mutually indifferent candidates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{ExplorationMode, KernelConfig};
use crate::error::{ConfigError, KernelResult};
use crate::semantics::Candidate;
use crate::symbol::Symbol;

/// Chooses one of several indifferent candidates.
pub trait SelectionPolicy: Send {
    /// Pick a candidate. Returns `None` only for an empty slice.
    fn select(&mut self, candidates: &[Candidate]) -> Option<Symbol>;

    fn name(&self) -> &str;
}

/// Built-in selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExplorationPolicy {
    First,
    Last,
    Random,
    EpsilonGreedy { epsilon: f64 },
    Softmax { temperature: f64 },
}

impl ExplorationPolicy {
    pub fn from_config(config: &KernelConfig) -> Self {
        match config.exploration {
            ExplorationMode::First => Self::First,
            ExplorationMode::Last => Self::Last,
            ExplorationMode::Random => Self::Random,
            ExplorationMode::EpsilonGreedy => Self::EpsilonGreedy {
                epsilon: config.epsilon,
            },
            ExplorationMode::Softmax => Self::Softmax {
                temperature: config.temperature,
            },
        }
    }

    /// Same bounds as [`KernelConfig::validate`].
    pub fn validate(&self) -> KernelResult<()> {
        let message = match *self {
            Self::EpsilonGreedy { epsilon } if !(0.0..=1.0).contains(&epsilon) => {
                "epsilon must lie in [0, 1]"
            }
            Self::Softmax { temperature } if !(temperature.is_finite() && temperature > 0.0) => {
                "temperature must be a positive finite number"
            }
            _ => return Ok(()),
        };
        Err(ConfigError::Invalid {
            message: message.to_string(),
        }
        .into())
    }
}

/// Numeric-indifferent value of a candidate; missing and non-finite values count as zero.
fn weight(c: &Candidate) -> f64 {
    c.numeric.filter(|n| n.is_finite()).unwrap_or(0.0)
}

/// An [`ExplorationPolicy`] with its own seeded RNG.
#[derive(Debug)]
pub struct Exploration {
    policy: ExplorationPolicy,
    rng: StdRng,
}

impl Exploration {
    pub fn new(policy: ExplorationPolicy, seed: Option<u64>) -> KernelResult<Self> {
        policy.validate()?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { policy, rng })
    }

    pub fn from_config(config: &KernelConfig) -> KernelResult<Self> {
        Self::new(ExplorationPolicy::from_config(config), config.seed)
    }

    pub fn policy(&self) -> ExplorationPolicy {
        self.policy
    }

    fn greedy(candidates: &[Candidate]) -> Option<Symbol> {
        let mut best: Option<&Candidate> = None;
        for c in candidates {
            let better = match best {
                None => true,
                Some(b) => weight(c) > weight(b),
            };
            if better {
                best = Some(c);
            }
        }
        best.map(|c| c.value)
    }

    fn uniform(&mut self, candidates: &[Candidate]) -> Option<Symbol> {
        if candidates.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..candidates.len());
        Some(candidates[i].value)
    }

    fn boltzmann(&mut self, candidates: &[Candidate], temperature: f64) -> Option<Symbol> {
        if candidates.is_empty() {
            return None;
        }
        let values: Vec<f64> = candidates
            .iter()
            .map(|c| weight(c) / temperature)
            .collect();
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = values.iter().map(|v| (v - max).exp()).collect();
        let total: f64 = weights.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return self.uniform(candidates);
        }
        let mut point = self.rng.gen_range(0.0..total);
        for (c, w) in candidates.iter().zip(&weights) {
            if point < *w {
                return Some(c.value);
            }
            point -= w;
        }
        candidates.last().map(|c| c.value)
    }
}

impl SelectionPolicy for Exploration {
    fn select(&mut self, candidates: &[Candidate]) -> Option<Symbol> {
        match self.policy {
            ExplorationPolicy::First => candidates.first().map(|c| c.value),
            ExplorationPolicy::Last => candidates.last().map(|c| c.value),
            ExplorationPolicy::Random => self.uniform(candidates),
            ExplorationPolicy::EpsilonGreedy { epsilon } => {
                if self.rng.gen_bool(epsilon.clamp(0.0, 1.0)) {
                    self.uniform(candidates)
                } else {
                    Self::greedy(candidates)
                }
            }
            ExplorationPolicy::Softmax { temperature } => self.boltzmann(candidates, temperature),
        }
    }

    fn name(&self) -> &str {
        match self.policy {
            ExplorationPolicy::First => "first",
            ExplorationPolicy::Last => "last",
            ExplorationPolicy::Random => "random",
            ExplorationPolicy::EpsilonGreedy { .. } => "epsilon-greedy",
            ExplorationPolicy::Softmax { .. } => "softmax",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(id: u64) -> Symbol {
        Symbol::new(id).unwrap()
    }

    fn cands(values: &[(u64, Option<f64>)]) -> Vec<Candidate> {
        values
            .iter()
            .map(|&(v, n)| Candidate {
                value: sym(v),
                numeric: n,
            })
            .collect()
    }

    #[test]
    fn first_and_last() {
        let c = cands(&[(1, None), (2, None), (3, None)]);
        assert_eq!(Exploration::new(ExplorationPolicy::First, Some(1)).unwrap().select(&c), Some(sym(1)));
        assert_eq!(Exploration::new(ExplorationPolicy::Last, Some(1)).unwrap().select(&c), Some(sym(3)));
    }

    #[test]
    fn empty_candidates_select_nothing() {
        let mut p = Exploration::new(ExplorationPolicy::Random, Some(3)).unwrap();
        assert_eq!(p.select(&[]), None);
    }

    #[test]
    fn seeded_random_is_reproducible() {
        let c = cands(&[(1, None), (2, None), (3, None), (4, None)]);
        let mut a = Exploration::new(ExplorationPolicy::Random, Some(99)).unwrap();
        let mut b = Exploration::new(ExplorationPolicy::Random, Some(99)).unwrap();
        let picks_a: Vec<_> = (0..20).map(|_| a.select(&c)).collect();
        let picks_b: Vec<_> = (0..20).map(|_| b.select(&c)).collect();
        assert_eq!(picks_a, picks_b);
        assert!(picks_a.iter().all(|p| p.is_some()));
    }

    #[test]
    fn greedy_with_zero_epsilon_takes_highest_value() {
        let c = cands(&[(1, Some(0.2)), (2, Some(0.9)), (3, None)]);
        let mut p = Exploration::new(ExplorationPolicy::EpsilonGreedy { epsilon: 0.0 }, Some(5)).unwrap();
        for _ in 0..10 {
            assert_eq!(p.select(&c), Some(sym(2)));
        }
    }

    #[test]
    fn softmax_strongly_favours_large_values() {
        let c = cands(&[(1, Some(0.0)), (2, Some(50.0))]);
        let mut p = Exploration::new(ExplorationPolicy::Softmax { temperature: 1.0 }, Some(11)).unwrap();
        let hits = (0..100).filter(|_| p.select(&c) == Some(sym(2))).count();
        assert!(hits > 95);
    }

    #[test]
    fn softmax_ignores_non_finite_values() {
        let c = cands(&[(1, Some(f64::INFINITY)), (2, Some(0.0)), (3, Some(f64::NAN))]);
        let mut p = Exploration::new(ExplorationPolicy::Softmax { temperature: 1.0 }, Some(2)).unwrap();
        for _ in 0..50 {
            assert!(p.select(&c).is_some());
        }
    }

    #[test]
    fn softmax_overflowing_weights_fall_back_to_uniform() {
        let c = cands(&[(1, Some(f64::MAX)), (2, Some(-f64::MAX))]);
        let mut p = Exploration::new(ExplorationPolicy::Softmax { temperature: 1e-300 }, Some(4)).unwrap();
        let picks: Vec<_> = (0..50).map(|_| p.select(&c)).collect();
        assert!(picks.iter().all(|v| *v == Some(sym(1)) || *v == Some(sym(2))));
    }

    #[test]
    fn greedy_treats_infinite_value_as_zero() {
        let c = cands(&[(1, Some(f64::INFINITY)), (2, Some(0.5))]);
        let mut p = Exploration::new(ExplorationPolicy::EpsilonGreedy { epsilon: 0.0 }, Some(8)).unwrap();
        assert_eq!(p.select(&c), Some(sym(2)));
    }

    #[test]
    fn out_of_range_parameters_are_rejected() {
        assert!(Exploration::new(ExplorationPolicy::Softmax { temperature: 0.0 }, None).is_err());
        assert!(Exploration::new(ExplorationPolicy::Softmax { temperature: f64::NAN }, None).is_err());
        assert!(Exploration::new(ExplorationPolicy::EpsilonGreedy { epsilon: 1.5 }, None).is_err());
        assert!(Exploration::new(ExplorationPolicy::EpsilonGreedy { epsilon: f64::NAN }, None).is_err());
        assert!(Exploration::new(ExplorationPolicy::EpsilonGreedy { epsilon: 1.0 }, None).is_ok());
    }

    #[test]
    fn policy_from_config() {
        let config = KernelConfig {
            exploration: ExplorationMode::Softmax,
            temperature: 0.5,
            ..Default::default()
        };
        assert_eq!(
            ExplorationPolicy::from_config(&config),
            ExplorationPolicy::Softmax { temperature: 0.5 }
        );
    }
}
