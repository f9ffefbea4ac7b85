//! Per-family payloads attached to features.
//!
//! Each feature carries exactly one payload of its own family: a
//! [`SharedParams`] in the kind that owns it, and a [`FamilyStats`] in every
//! group of that kind. Only the active family is stored.
//!
//! Statistics here are plain accumulators (counts, sums, running moments).
//! Turning them into posterior scores is left to the distributions library
//! behind [`Posterior`](crate::query::Posterior).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::{FeatureFamily, FeatureValue};

/// Failure to update a statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FamilyStatsError {
    /// The value's representation does not match the family.
    #[error("value type does not match the statistic's family")]
    TypeMismatch,
    /// Removing a value that was never added.
    #[error("statistic would go negative")]
    Underflow,
}

// =============================================================================
// SharedParams
// =============================================================================

/// Hyperparameters of one feature, owned by its kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedParams {
    BetaBernoulli { alpha: f32, beta: f32 },
    DirichletDiscrete { alphas: Vec<f32> },
    DirichletProcessDiscrete { gamma: f32, alpha: f32 },
    GammaPoisson { alpha: f32, inv_beta: f32 },
    BetaNegativeBinomial { r: u32, alpha: f32, beta: f32 },
    NormalInverseChiSq { mu: f32, kappa: f32, sigmasq: f32, nu: f32 },
}

impl SharedParams {
    /// Weakly informative defaults for a family.
    pub fn default_for(family: FeatureFamily) -> Self {
        match family {
            FeatureFamily::BetaBernoulli => Self::BetaBernoulli {
                alpha: 0.5,
                beta: 0.5,
            },
            FeatureFamily::DirichletDiscrete { dim } => Self::DirichletDiscrete {
                alphas: vec![0.5; dim as usize],
            },
            FeatureFamily::DirichletProcessDiscrete => Self::DirichletProcessDiscrete {
                gamma: 0.5,
                alpha: 0.5,
            },
            FeatureFamily::GammaPoisson => Self::GammaPoisson {
                alpha: 1.0,
                inv_beta: 1.0,
            },
            FeatureFamily::BetaNegativeBinomial => Self::BetaNegativeBinomial {
                r: 1,
                alpha: 1.0,
                beta: 1.0,
            },
            FeatureFamily::NormalInverseChiSq => Self::NormalInverseChiSq {
                mu: 0.0,
                kappa: 1.0,
                sigmasq: 1.0,
                nu: 1.0,
            },
        }
    }

    /// Family these parameters belong to.
    pub fn family(&self) -> FeatureFamily {
        match self {
            Self::BetaBernoulli { .. } => FeatureFamily::BetaBernoulli,
            Self::DirichletDiscrete { alphas } => FeatureFamily::DirichletDiscrete {
                dim: alphas.len() as u32,
            },
            Self::DirichletProcessDiscrete { .. } => FeatureFamily::DirichletProcessDiscrete,
            Self::GammaPoisson { .. } => FeatureFamily::GammaPoisson,
            Self::BetaNegativeBinomial { .. } => FeatureFamily::BetaNegativeBinomial,
            Self::NormalInverseChiSq { .. } => FeatureFamily::NormalInverseChiSq,
        }
    }
}

// =============================================================================
// FamilyStats
// =============================================================================

/// Sufficient statistics of one feature within one group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FamilyStats {
    BetaBernoulli {
        heads: u64,
        tails: u64,
    },
    DirichletDiscrete {
        counts: Vec<u64>,
    },
    DirichletProcessDiscrete {
        counts: BTreeMap<u32, u64>,
        total: u64,
    },
    GammaPoisson {
        count: u64,
        sum: u64,
        log_prod: f64,
    },
    BetaNegativeBinomial {
        count: u64,
        sum: u64,
    },
    /// Running mean and sum of squared deviations.
    NormalInverseChiSq {
        count: u64,
        mean: f64,
        count_times_variance: f64,
    },
}

impl FamilyStats {
    /// Statistics of an empty group.
    pub fn empty(family: FeatureFamily) -> Self {
        match family {
            FeatureFamily::BetaBernoulli => Self::BetaBernoulli { heads: 0, tails: 0 },
            FeatureFamily::DirichletDiscrete { dim } => Self::DirichletDiscrete {
                counts: vec![0; dim as usize],
            },
            FeatureFamily::DirichletProcessDiscrete => Self::DirichletProcessDiscrete {
                counts: BTreeMap::new(),
                total: 0,
            },
            FeatureFamily::GammaPoisson => Self::GammaPoisson {
                count: 0,
                sum: 0,
                log_prod: 0.0,
            },
            FeatureFamily::BetaNegativeBinomial => Self::BetaNegativeBinomial { count: 0, sum: 0 },
            FeatureFamily::NormalInverseChiSq => Self::NormalInverseChiSq {
                count: 0,
                mean: 0.0,
                count_times_variance: 0.0,
            },
        }
    }

    /// Number of observations accumulated.
    pub fn count(&self) -> u64 {
        match self {
            Self::BetaBernoulli { heads, tails } => heads + tails,
            Self::DirichletDiscrete { counts } => counts.iter().sum(),
            Self::DirichletProcessDiscrete { total, .. } => *total,
            Self::GammaPoisson { count, .. }
            | Self::BetaNegativeBinomial { count, .. }
            | Self::NormalInverseChiSq { count, .. } => *count,
        }
    }

    /// Accumulate one observation.
    pub fn add(&mut self, value: &FeatureValue) -> Result<(), FamilyStatsError> {
        match (self, *value) {
            (Self::BetaBernoulli { heads, tails }, FeatureValue::Boolean(b)) => {
                if b {
                    *heads += 1;
                } else {
                    *tails += 1;
                }
            }
            (Self::DirichletDiscrete { counts }, FeatureValue::Count(c)) => {
                let slot = counts
                    .get_mut(c as usize)
                    .ok_or(FamilyStatsError::TypeMismatch)?;
                *slot += 1;
            }
            (Self::DirichletProcessDiscrete { counts, total }, FeatureValue::Count(c)) => {
                *counts.entry(c).or_insert(0) += 1;
                *total += 1;
            }
            (
                Self::GammaPoisson {
                    count,
                    sum,
                    log_prod,
                },
                FeatureValue::Count(c),
            ) => {
                *count += 1;
                *sum += u64::from(c);
                *log_prod += log_factorial(c);
            }
            (Self::BetaNegativeBinomial { count, sum }, FeatureValue::Count(c)) => {
                *count += 1;
                *sum += u64::from(c);
            }
            (
                Self::NormalInverseChiSq {
                    count,
                    mean,
                    count_times_variance,
                },
                FeatureValue::Real(x),
            ) => {
                let x = f64::from(x);
                *count += 1;
                let delta = x - *mean;
                *mean += delta / *count as f64;
                *count_times_variance += delta * (x - *mean);
            }
            _ => return Err(FamilyStatsError::TypeMismatch),
        }
        Ok(())
    }

    /// Remove one previously added observation.
    pub fn remove(&mut self, value: &FeatureValue) -> Result<(), FamilyStatsError> {
        match (self, *value) {
            (Self::BetaBernoulli { heads, tails }, FeatureValue::Boolean(b)) => {
                let slot = if b { heads } else { tails };
                *slot = slot.checked_sub(1).ok_or(FamilyStatsError::Underflow)?;
            }
            (Self::DirichletDiscrete { counts }, FeatureValue::Count(c)) => {
                let slot = counts
                    .get_mut(c as usize)
                    .ok_or(FamilyStatsError::TypeMismatch)?;
                *slot = slot.checked_sub(1).ok_or(FamilyStatsError::Underflow)?;
            }
            (Self::DirichletProcessDiscrete { counts, total }, FeatureValue::Count(c)) => {
                let slot = counts.get_mut(&c).ok_or(FamilyStatsError::Underflow)?;
                *slot -= 1;
                if *slot == 0 {
                    counts.remove(&c);
                }
                *total = total.checked_sub(1).ok_or(FamilyStatsError::Underflow)?;
            }
            (
                Self::GammaPoisson {
                    count,
                    sum,
                    log_prod,
                },
                FeatureValue::Count(c),
            ) => {
                *count = count.checked_sub(1).ok_or(FamilyStatsError::Underflow)?;
                *sum = sum
                    .checked_sub(u64::from(c))
                    .ok_or(FamilyStatsError::Underflow)?;
                *log_prod = if *count == 0 {
                    0.0
                } else {
                    *log_prod - log_factorial(c)
                };
            }
            (Self::BetaNegativeBinomial { count, sum }, FeatureValue::Count(c)) => {
                *count = count.checked_sub(1).ok_or(FamilyStatsError::Underflow)?;
                *sum = sum
                    .checked_sub(u64::from(c))
                    .ok_or(FamilyStatsError::Underflow)?;
            }
            (
                Self::NormalInverseChiSq {
                    count,
                    mean,
                    count_times_variance,
                },
                FeatureValue::Real(x),
            ) => {
                let x = f64::from(x);
                match *count {
                    0 => return Err(FamilyStatsError::Underflow),
                    1 => {
                        *count = 0;
                        *mean = 0.0;
                        *count_times_variance = 0.0;
                    }
                    n => {
                        let old_mean = *mean;
                        let new_mean = (old_mean * n as f64 - x) / (n - 1) as f64;
                        *count_times_variance -= (x - new_mean) * (x - old_mean);
                        *count_times_variance = count_times_variance.max(0.0);
                        *mean = new_mean;
                        *count = n - 1;
                    }
                }
            }
            _ => return Err(FamilyStatsError::TypeMismatch),
        }
        Ok(())
    }

    /// Fold another group's statistics into this one.
    pub fn merge(&mut self, other: &FamilyStats) -> Result<(), FamilyStatsError> {
        match (self, other) {
            (
                Self::BetaBernoulli { heads, tails },
                Self::BetaBernoulli {
                    heads: h,
                    tails: t,
                },
            ) => {
                *heads += h;
                *tails += t;
            }
            (Self::DirichletDiscrete { counts }, Self::DirichletDiscrete { counts: other }) => {
                if counts.len() != other.len() {
                    return Err(FamilyStatsError::TypeMismatch);
                }
                for (c, o) in counts.iter_mut().zip(other) {
                    *c += o;
                }
            }
            (
                Self::DirichletProcessDiscrete { counts, total },
                Self::DirichletProcessDiscrete {
                    counts: other,
                    total: other_total,
                },
            ) => {
                for (&value, &n) in other {
                    *counts.entry(value).or_insert(0) += n;
                }
                *total += other_total;
            }
            (
                Self::GammaPoisson {
                    count,
                    sum,
                    log_prod,
                },
                Self::GammaPoisson {
                    count: c,
                    sum: s,
                    log_prod: l,
                },
            ) => {
                *count += c;
                *sum += s;
                *log_prod += l;
            }
            (
                Self::BetaNegativeBinomial { count, sum },
                Self::BetaNegativeBinomial { count: c, sum: s },
            ) => {
                *count += c;
                *sum += s;
            }
            (
                Self::NormalInverseChiSq {
                    count,
                    mean,
                    count_times_variance,
                },
                Self::NormalInverseChiSq {
                    count: n_b,
                    mean: mean_b,
                    count_times_variance: m2_b,
                },
            ) => {
                if *n_b > 0 {
                    let n_a = *count as f64;
                    let n_b_f = *n_b as f64;
                    let total = n_a + n_b_f;
                    let delta = mean_b - *mean;
                    *mean += delta * n_b_f / total;
                    *count_times_variance += m2_b + delta * delta * n_a * n_b_f / total;
                    *count += n_b;
                }
            }
            _ => return Err(FamilyStatsError::TypeMismatch),
        }
        Ok(())
    }
}

/// `ln(n!) = ln Γ(n + 1)`, accumulated by Gamma-Poisson for its marginal
/// likelihood.
#[inline]
fn log_factorial(n: u32) -> f64 {
    if n < 2 {
        return 0.0;
    }
    libm::lgamma(f64::from(n) + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn bernoulli_add_remove() {
        let mut stats = FamilyStats::empty(FeatureFamily::BetaBernoulli);
        stats.add(&FeatureValue::Boolean(true)).unwrap();
        stats.add(&FeatureValue::Boolean(false)).unwrap();
        stats.add(&FeatureValue::Boolean(true)).unwrap();
        assert_eq!(stats, FamilyStats::BetaBernoulli { heads: 2, tails: 1 });

        stats.remove(&FeatureValue::Boolean(false)).unwrap();
        assert_eq!(
            stats.remove(&FeatureValue::Boolean(false)),
            Err(FamilyStatsError::Underflow)
        );
        assert_eq!(stats.count(), 2);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut stats = FamilyStats::empty(FeatureFamily::GammaPoisson);
        assert_eq!(
            stats.add(&FeatureValue::Real(1.0)),
            Err(FamilyStatsError::TypeMismatch)
        );
        let mut dd = FamilyStats::empty(FeatureFamily::DirichletDiscrete { dim: 2 });
        assert_eq!(
            dd.add(&FeatureValue::Count(2)),
            Err(FamilyStatsError::TypeMismatch)
        );
    }

    #[test]
    fn normal_moments_survive_removal() {
        let mut stats = FamilyStats::empty(FeatureFamily::NormalInverseChiSq);
        for x in [1.0f32, 2.0, 4.0, 7.0] {
            stats.add(&FeatureValue::Real(x)).unwrap();
        }
        stats.remove(&FeatureValue::Real(4.0)).unwrap();

        let FamilyStats::NormalInverseChiSq {
            count,
            mean,
            count_times_variance,
        } = stats
        else {
            panic!("wrong family");
        };
        // Remaining {1, 2, 7}: mean 10/3, sum of squared deviations 62/3.
        assert_eq!(count, 3);
        assert_abs_diff_eq!(mean, 10.0 / 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(count_times_variance, 62.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn merge_matches_sequential_adds() {
        let family = FeatureFamily::NormalInverseChiSq;
        let mut a = FamilyStats::empty(family);
        let mut b = FamilyStats::empty(family);
        let mut all = FamilyStats::empty(family);
        for (i, x) in [0.5f32, -1.0, 3.0, 2.5, 8.0].iter().enumerate() {
            let v = FeatureValue::Real(*x);
            let half = if i % 2 == 0 { &mut a } else { &mut b };
            half.add(&v).unwrap();
            all.add(&v).unwrap();
        }
        a.merge(&b).unwrap();

        match (a, all) {
            (
                FamilyStats::NormalInverseChiSq {
                    count,
                    mean,
                    count_times_variance,
                },
                FamilyStats::NormalInverseChiSq {
                    count: n,
                    mean: m,
                    count_times_variance: v,
                },
            ) => {
                assert_eq!(count, n);
                assert_abs_diff_eq!(mean, m, epsilon = 1e-9);
                assert_abs_diff_eq!(count_times_variance, v, epsilon = 1e-9);
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn log_factorial_is_closed_form() {
        assert_eq!(log_factorial(0), 0.0);
        assert_eq!(log_factorial(1), 0.0);
        assert_abs_diff_eq!(log_factorial(5), 120f64.ln(), epsilon = 1e-12);
        let direct: f64 = (2..=1000u32).map(|k| f64::from(k).ln()).sum();
        assert_abs_diff_eq!(log_factorial(1000), direct, epsilon = 1e-8);
    }

    #[test]
    fn gamma_poisson_accepts_huge_counts() {
        let mut stats = FamilyStats::empty(FeatureFamily::GammaPoisson);
        stats.add(&FeatureValue::Count(u32::MAX)).unwrap();
        stats.add(&FeatureValue::Count(3)).unwrap();
        let FamilyStats::GammaPoisson { count, sum, log_prod } = stats else {
            panic!("wrong family");
        };
        assert_eq!(count, 2);
        assert_eq!(sum, u64::from(u32::MAX) + 3);
        // Stirling: ln(n!) ≈ n ln n - n for large n.
        let n = f64::from(u32::MAX);
        assert!(log_prod.is_finite());
        assert_abs_diff_eq!(log_prod, n * n.ln() - n, epsilon = 1e-6 * n);

        stats.remove(&FeatureValue::Count(u32::MAX)).unwrap();
        let FamilyStats::GammaPoisson { log_prod, .. } = stats else {
            panic!("wrong family");
        };
        assert_abs_diff_eq!(log_prod, 6f64.ln(), epsilon = 1e-3);
    }

    #[test]
    fn dpd_drops_empty_buckets() {
        let mut stats = FamilyStats::empty(FeatureFamily::DirichletProcessDiscrete);
        stats.add(&FeatureValue::Count(40)).unwrap();
        stats.remove(&FeatureValue::Count(40)).unwrap();
        assert_eq!(stats, FamilyStats::empty(FeatureFamily::DirichletProcessDiscrete));
    }

    #[test]
    fn shared_params_family_roundtrip() {
        for family in [
            FeatureFamily::BetaBernoulli,
            FeatureFamily::DirichletDiscrete { dim: 3 },
            FeatureFamily::DirichletProcessDiscrete,
            FeatureFamily::GammaPoisson,
            FeatureFamily::BetaNegativeBinomial,
            FeatureFamily::NormalInverseChiSq,
        ] {
            assert_eq!(SharedParams::default_for(family).family(), family);
        }
    }
}
