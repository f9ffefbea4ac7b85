//! CrossCat state: kinds over features, groups over rows.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::family::{FamilyStats, SharedParams};
use crate::schema::{FeatureFamily, FeatureId};
use crate::value::RowId;

/// Identifier of a group, unique within its kind.
pub type GroupId = u32;

// =============================================================================
// Topology / HyperPrior
// =============================================================================

/// Pitman-Yor parameters of a partition process.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub alpha: f32,
    pub d: f32,
}

impl Default for Topology {
    fn default() -> Self {
        Self { alpha: 1.0, d: 0.0 }
    }
}

/// Candidate values of shared parameters, keyed by parameter name.
pub type ParamGrids = BTreeMap<String, Vec<f32>>;

/// Candidate grids the hyperparameter kernel samples from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HyperPrior {
    /// Candidates for the feature-level (kind) process.
    pub outer: Vec<Topology>,
    /// Candidates for each kind's row-level (group) process.
    pub inner: Vec<Topology>,
    /// Shared-parameter candidates keyed by family tag (`bb`, `gp`, ...).
    pub shared: BTreeMap<String, ParamGrids>,
}

impl HyperPrior {
    /// The stock grids: a Pitman-Yor grid for both processes and
    /// log-spaced candidates for every family parameter.
    pub fn default_grids() -> Self {
        let dd_alpha = logspace(-1.0, 2.0, 12);
        let pos = logspace(-8.0, 8.0, 100);
        let mut mu: Vec<f32> = pos.iter().rev().map(|x| -x).collect();
        mu.push(0.0);
        mu.extend_from_slice(&pos);
        let powers = |range: std::ops::Range<i32>| -> Vec<f32> {
            range.map(|p| 2f32.powi(p)).collect()
        };

        let families: [(FeatureFamily, Vec<(&str, Vec<f32>)>); 6] = [
            (
                FeatureFamily::BetaBernoulli,
                vec![("alpha", dd_alpha.clone()), ("beta", dd_alpha.clone())],
            ),
            (
                FeatureFamily::DirichletDiscrete { dim: 0 },
                vec![("alpha", dd_alpha)],
            ),
            (
                FeatureFamily::DirichletProcessDiscrete,
                vec![
                    ("gamma", pow10(left_heavy(-1.0, 2.0, 30))),
                    ("alpha", pow10(right_heavy(-1.0, 1.0, 20))),
                ],
            ),
            (
                FeatureFamily::GammaPoisson,
                vec![
                    ("alpha", logspace(-1.0, 5.0, 100)),
                    ("inv_beta", logspace(-5.0, 1.0, 100)),
                ],
            ),
            (
                FeatureFamily::BetaNegativeBinomial,
                vec![
                    ("alpha", powers(-3..1)),
                    ("beta", powers(0..13)),
                    ("r", powers(0..13)),
                ],
            ),
            (
                FeatureFamily::NormalInverseChiSq,
                vec![
                    ("mu", mu),
                    ("sigmasq", pos),
                    ("kappa", logspace(-2.0, 2.0, 30)),
                    ("nu", logspace(0.0, 2.0, 30)),
                ],
            ),
        ];
        let shared = families
            .into_iter()
            .map(|(family, params)| {
                let grids = params
                    .into_iter()
                    .map(|(name, values)| (name.to_string(), values))
                    .collect();
                (family.tag().to_string(), grids)
            })
            .collect();

        let topology = pitman_yor_grid();
        Self {
            outer: topology.clone(),
            inner: topology,
            shared,
        }
    }

    /// Candidates for one shared parameter of `family`.
    pub fn grid(&self, family: FeatureFamily, param: &str) -> Option<&[f32]> {
        self.shared
            .get(family.tag())
            .and_then(|grids| grids.get(param))
            .map(Vec::as_slice)
    }
}

/// `count` points, evenly spaced in log10 between `10^lo` and `10^hi`.
fn logspace(lo: f64, hi: f64, count: usize) -> Vec<f32> {
    pow10(linspace(lo, hi, count))
}

fn linspace(lo: f64, hi: f64, count: usize) -> Vec<f64> {
    let step = if count > 1 { (hi - lo) / (count - 1) as f64 } else { 0.0 };
    (0..count).map(|i| lo + step * i as f64).collect()
}

fn pow10(exponents: Vec<f64>) -> Vec<f32> {
    exponents.into_iter().map(|e| 10f64.powf(e) as f32).collect()
}

/// Points in `[lo, hi]` packed towards `lo`.
fn left_heavy(lo: f64, hi: f64, count: usize) -> Vec<f64> {
    linspace(0.0, std::f64::consts::FRAC_PI_2, count)
        .into_iter()
        .map(|t| lo + (hi - lo) * (1.0 - t.cos()))
        .collect()
}

/// Points in `[lo, hi]` packed towards `hi`.
fn right_heavy(lo: f64, hi: f64, count: usize) -> Vec<f64> {
    linspace(0.0, std::f64::consts::FRAC_PI_2, count)
        .into_iter()
        .map(|t| lo + (hi - lo) * t.sin())
        .collect()
}

/// 20 concentrations in `[0.1, 100]` crossed with 10 discounts in `[0, 0.5)`.
fn pitman_yor_grid() -> Vec<Topology> {
    let alphas = logspace(-1.0, 2.0, 20);
    let discounts: Vec<f32> = (0..10).map(|i| i as f32 * 0.05).collect();
    alphas
        .iter()
        .flat_map(|&alpha| discounts.iter().map(move |&d| Topology { alpha, d }))
        .collect()
}

// =============================================================================
// Group
// =============================================================================

/// A cluster of rows within a kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub(crate) count: u64,
    pub(crate) stats: BTreeMap<FeatureId, FamilyStats>,
}

impl Group {
    pub(crate) fn empty<'a>(features: impl IntoIterator<Item = (FeatureId, &'a SharedParams)>) -> Self {
        Self {
            count: 0,
            stats: features
                .into_iter()
                .map(|(id, shared)| (id, FamilyStats::empty(shared.family())))
                .collect(),
        }
    }

    /// Number of rows assigned to this group.
    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Statistics of one feature owned by the enclosing kind.
    #[inline]
    pub fn stats(&self, feature: FeatureId) -> Option<&FamilyStats> {
        self.stats.get(&feature)
    }

    pub fn iter_stats(&self) -> impl Iterator<Item = (FeatureId, &FamilyStats)> {
        self.stats.iter().map(|(&id, s)| (id, s))
    }
}

// =============================================================================
// Kind
// =============================================================================

/// A set of features sharing one partition of the rows.
///
/// The kind owns its groups and its column of the row-to-group assignment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Kind {
    pub(crate) featureids: BTreeSet<FeatureId>,
    pub(crate) shared: BTreeMap<FeatureId, SharedParams>,
    pub(crate) topology: Topology,
    pub(crate) groups: BTreeMap<GroupId, Group>,
    pub(crate) assignments: BTreeMap<RowId, GroupId>,
    pub(crate) next_group_id: GroupId,
}

impl Kind {
    pub(crate) fn new(topology: Topology) -> Self {
        Self {
            topology,
            ..Self::default()
        }
    }

    /// Features owned by this kind.
    #[inline]
    pub fn featureids(&self) -> &BTreeSet<FeatureId> {
        &self.featureids
    }

    #[inline]
    pub fn owns(&self, feature: FeatureId) -> bool {
        self.featureids.contains(&feature)
    }

    #[inline]
    pub fn shared(&self, feature: FeatureId) -> Option<&SharedParams> {
        self.shared.get(&feature)
    }

    #[inline]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    #[inline]
    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &Group)> {
        self.groups.iter().map(|(&id, g)| (id, g))
    }

    pub fn group_ids(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.groups.keys().copied()
    }

    #[inline]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Group a row belongs to in this kind.
    #[inline]
    pub fn group_of(&self, row: RowId) -> Option<GroupId> {
        self.assignments.get(&row).copied()
    }

    /// Rows currently assigned to `group`, in increasing id order.
    pub fn members(&self, group: GroupId) -> Vec<RowId> {
        self.assignments
            .iter()
            .filter(|(_, &g)| g == group)
            .map(|(&row, _)| row)
            .collect()
    }

    /// Allocate a fresh, empty group.
    pub(crate) fn push_empty_group(&mut self) -> GroupId {
        let id = self.next_group_id;
        self.next_group_id += 1;
        let group = Group::empty(self.shared.iter().map(|(&f, s)| (f, s)));
        self.groups.insert(id, group);
        id
    }

    /// Take ownership of `feature`, adding empty statistics to every group.
    pub(crate) fn adopt_feature(&mut self, feature: FeatureId, shared: SharedParams) {
        let family: FeatureFamily = shared.family();
        self.featureids.insert(feature);
        self.shared.insert(feature, shared);
        for group in self.groups.values_mut() {
            group.stats.insert(feature, FamilyStats::empty(family));
        }
    }
}

// =============================================================================
// CrossCat
// =============================================================================

/// The full partition state.
///
/// Kinds sit behind `Arc` so copies of the state share every kind that a
/// mutation does not touch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossCat {
    pub kinds: Vec<Arc<Kind>>,
    pub topology: Topology,
    pub hyper_prior: Option<HyperPrior>,
}

/// A row's group in every kind, in kind order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub rowid: RowId,
    pub groupids: Vec<GroupId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_grids_cover_every_family() {
        let prior = HyperPrior::default_grids();
        assert_eq!(prior.outer.len(), 200);
        assert_eq!(prior.outer, prior.inner);
        assert!(prior.outer.iter().all(|t| t.alpha > 0.0 && (0.0..0.5).contains(&t.d)));

        let bb = prior.grid(FeatureFamily::BetaBernoulli, "alpha").unwrap();
        assert_eq!(bb.len(), 12);
        assert_relative_eq!(bb[0], 0.1, max_relative = 1e-6);
        assert_relative_eq!(bb[11], 100.0, max_relative = 1e-6);

        let dd = prior
            .grid(FeatureFamily::DirichletDiscrete { dim: 7 }, "alpha")
            .unwrap();
        assert_eq!(dd, bb);

        let mu = prior.grid(FeatureFamily::NormalInverseChiSq, "mu").unwrap();
        assert_eq!(mu.len(), 201);
        assert_eq!(mu[100], 0.0);
        assert!(mu.windows(2).all(|w| w[0] < w[1]));

        let r = prior.grid(FeatureFamily::BetaNegativeBinomial, "r").unwrap();
        assert_eq!(r.first(), Some(&1.0));
        assert_eq!(r.last(), Some(&4096.0));

        let gamma = prior
            .grid(FeatureFamily::DirichletProcessDiscrete, "gamma")
            .unwrap();
        assert_eq!(gamma.len(), 30);
        assert_relative_eq!(gamma[0], 0.1, max_relative = 1e-6);
        assert_relative_eq!(gamma[29], 100.0, max_relative = 1e-5);
        // Packed towards the low end.
        assert!(gamma[1] - gamma[0] < gamma[29] - gamma[28]);

        assert!(prior.grid(FeatureFamily::GammaPoisson, "beta").is_none());
        assert_eq!(prior.shared.len(), 6);
    }

    #[test]
    fn hyper_prior_serde_roundtrip() {
        let prior = HyperPrior::default_grids();
        let json = serde_json::to_string(&prior).unwrap();
        assert_eq!(serde_json::from_str::<HyperPrior>(&json).unwrap(), prior);
        let bytes = postcard::to_allocvec(&prior).unwrap();
        assert_eq!(postcard::from_bytes::<HyperPrior>(&bytes).unwrap(), prior);
    }
}
