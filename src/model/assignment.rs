//! Transactional two-level partition.
//!
//! [`AssignmentModel`] owns the [`CrossCat`] state, the row table and the
//! feature → kind lookup. Every mutation is staged on a draft and swapped in
//! only when all of its steps succeed:
//!
//! ```text
//! draft = model.clone()            // kinds behind Arc, rows behind Arc
//! op(&mut draft)?                  // Arc::make_mut copies touched kinds only
//! *model = draft                   // publish
//! ```
//!
//! On error the draft is dropped and the model is left exactly as it was.
//!
//! # Invariants
//!
//! After every successful mutation:
//!
//! - the kinds' feature sets partition the schema's features
//! - every group holds statistics for exactly the features of its kind
//! - every stored row is assigned to an existing group in every kind
//! - `Group::count` equals the number of rows assigned to the group
//!
//! A group whose count drops to zero is removed in the same mutation.
//! Groups created with [`AssignmentModel::create_group`] start empty and
//! stay until a row leaves them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use super::crosscat::{Assignment, CrossCat, GroupId, Kind, Topology};
use super::family::{FamilyStatsError, SharedParams};
use crate::error::{CrossCatError, Result};
use crate::schema::{FeatureId, SchemaIndex};
use crate::value::{Diff, DiffEngine, FeatureValues, Row, RowId};

/// Observer of statistic updates.
///
/// Notified once per `(kind, group, feature)` statistic touched by a
/// successful mutation, in the order the updates were applied. Rolled back
/// mutations notify nothing.
pub trait StatsAudit: Send + Sync {
    fn touched(&self, kind: usize, group: GroupId, feature: FeatureId);
}

type Touch = (usize, GroupId, FeatureId);

// =============================================================================
// AssignmentModel
// =============================================================================

/// Kinds, groups and row assignments over one schema.
///
/// Cloning is cheap: kinds, rows and the lookup cache are shared until a
/// mutation writes to them.
#[derive(Clone)]
pub struct AssignmentModel {
    index: Arc<SchemaIndex>,
    pub(crate) crosscat: CrossCat,
    pub(crate) rows: Arc<BTreeMap<RowId, FeatureValues>>,
    /// feature id -> kind index. Derived from `Kind::featureids`.
    feature_kind: Arc<Vec<usize>>,
    audit: Option<Arc<dyn StatsAudit>>,
    /// Touches withheld from `audit` until the owner publishes the model.
    held: Option<Vec<Touch>>,
}

impl fmt::Debug for AssignmentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssignmentModel")
            .field("n_features", &self.index.total_feature_count())
            .field("n_kinds", &self.crosscat.kinds.len())
            .field("n_rows", &self.rows.len())
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

impl PartialEq for AssignmentModel {
    fn eq(&self, other: &Self) -> bool {
        self.index.schema() == other.index.schema()
            && self.crosscat == other.crosscat
            && self.rows == other.rows
    }
}

impl AssignmentModel {
    // =========================================================================
    // Construction
    // =========================================================================

    /// One kind owning every feature, no rows.
    pub fn single_kind(index: Arc<SchemaIndex>, topology: Topology) -> Self {
        let features: Vec<FeatureId> = index.feature_ids().collect();
        let kind = build_kind(&index, &features, topology);
        let crosscat = CrossCat {
            kinds: vec![Arc::new(kind)],
            ..CrossCat::default()
        };
        Self::assemble(index, crosscat, BTreeMap::new())
    }

    /// One kind per entry of `partition`, no rows.
    ///
    /// Fails with `StructuralViolation` unless `partition` covers every
    /// feature exactly once.
    pub fn from_partition(
        index: Arc<SchemaIndex>,
        partition: &[Vec<FeatureId>],
        topology: Topology,
    ) -> Result<Self> {
        let n = index.total_feature_count();
        let mut seen = vec![false; n];
        for &feature in partition.iter().flatten() {
            let slot = seen.get_mut(feature as usize).ok_or_else(|| {
                CrossCatError::structural(format!("feature {feature} out of range for {n} features"))
            })?;
            if std::mem::replace(slot, true) {
                return Err(CrossCatError::structural(format!(
                    "feature {feature} listed in more than one kind"
                )));
            }
        }
        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(CrossCatError::structural(format!(
                "feature {missing} is not owned by any kind"
            )));
        }

        let kinds = partition
            .iter()
            .map(|features| Arc::new(build_kind(&index, features, topology)))
            .collect();
        let crosscat = CrossCat {
            kinds,
            ..CrossCat::default()
        };
        Ok(Self::assemble(index, crosscat, BTreeMap::new()))
    }

    /// Restore a model from saved parts, checking every invariant.
    pub fn from_parts(
        index: Arc<SchemaIndex>,
        crosscat: CrossCat,
        rows: BTreeMap<RowId, FeatureValues>,
    ) -> Result<Self> {
        for (&row, values) in &rows {
            for (&feature, value) in values {
                index.check_value(feature, value).map_err(|e| {
                    CrossCatError::structural(format!("stored row {row}: {e}"))
                })?;
            }
        }
        check_partition(&index, &crosscat)?;
        let model = Self::assemble(index, crosscat, rows);
        model.check_invariants()?;
        Ok(model)
    }

    fn assemble(
        index: Arc<SchemaIndex>,
        crosscat: CrossCat,
        rows: BTreeMap<RowId, FeatureValues>,
    ) -> Self {
        let feature_kind = Arc::new(feature_kinds(&index, &crosscat));
        Self {
            index,
            crosscat,
            rows: Arc::new(rows),
            feature_kind,
            audit: None,
            held: None,
        }
    }

    /// Install (or clear) the statistics observer.
    pub fn set_audit(&mut self, audit: Option<Arc<dyn StatsAudit>>) {
        self.audit = audit;
    }

    /// Buffer touches of later mutations instead of notifying the audit.
    pub(crate) fn hold_audit(&mut self) {
        if self.audit.is_some() {
            self.held = Some(Vec::new());
        }
    }

    /// Stop buffering and notify the audit of everything held so far.
    pub(crate) fn release_audit(&mut self) {
        if let (Some(audit), Some(held)) = (&self.audit, self.held.take()) {
            notify(audit.as_ref(), &held);
        }
    }

    /// Stop buffering and drop everything held so far.
    pub(crate) fn discard_audit(&mut self) {
        self.held = None;
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn index(&self) -> &Arc<SchemaIndex> {
        &self.index
    }

    #[inline]
    pub fn crosscat(&self) -> &CrossCat {
        &self.crosscat
    }

    #[inline]
    pub fn kind_count(&self) -> usize {
        self.crosscat.kinds.len()
    }

    #[inline]
    pub fn kind(&self, kind: usize) -> Option<&Kind> {
        self.crosscat.kinds.get(kind).map(Arc::as_ref)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &Kind> {
        self.crosscat.kinds.iter().map(Arc::as_ref)
    }

    #[inline]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Stored values of a row.
    #[inline]
    pub fn row(&self, row: RowId) -> Option<&FeatureValues> {
        self.rows.get(&row)
    }

    pub fn rows(&self) -> impl Iterator<Item = (RowId, &FeatureValues)> {
        self.rows.iter().map(|(&id, v)| (id, v))
    }

    /// Kind currently owning `feature`.
    pub fn kind_of(&self, feature: FeatureId) -> Result<usize> {
        self.feature_kind
            .get(feature as usize)
            .copied()
            .ok_or_else(|| {
                CrossCatError::schema(
                    feature,
                    format!("schema declares {} features", self.feature_kind.len()),
                )
            })
    }

    /// Group ids of a row in every kind.
    pub fn assignment(&self, row: RowId) -> Result<Assignment> {
        if !self.rows.contains_key(&row) {
            return Err(unknown_row(row));
        }
        let groupids = self
            .crosscat
            .kinds
            .iter()
            .enumerate()
            .map(|(k, kind)| {
                kind.group_of(row).ok_or_else(|| {
                    CrossCatError::structural(format!("row {row} has no group in kind {k}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Assignment { rowid: row, groupids })
    }

    /// Assignments of every row, in increasing row id order.
    pub fn assignments(&self) -> Result<Vec<Assignment>> {
        self.rows.keys().map(|&row| self.assignment(row)).collect()
    }

    // =========================================================================
    // Structural mutations
    // =========================================================================

    /// Append an empty kind and return its index.
    ///
    /// Existing rows are placed together in one new group, so the kind is
    /// immediately consistent with the row table.
    pub fn add_kind(&mut self, topology: Topology) -> usize {
        let mut kind = Kind::new(topology);
        if !self.rows.is_empty() {
            let group = kind.push_empty_group();
            for &row in self.rows.keys() {
                kind.assignments.insert(row, group);
            }
            if let Some(g) = kind.groups.get_mut(&group) {
                g.count = self.rows.len() as u64;
            }
        }
        self.crosscat.kinds.push(Arc::new(kind));
        let k = self.crosscat.kinds.len() - 1;
        debug!(kind = k, rows = self.rows.len(), "added kind");
        k
    }

    /// Allocate an empty group in `kind`.
    pub fn create_group(&mut self, kind: usize) -> Result<GroupId> {
        self.transact("create_group", |draft| {
            Ok(draft.kind_mut(kind)?.push_empty_group())
        })
    }

    /// Move one row to another group of the same kind.
    pub fn assign_row(&mut self, row: RowId, kind: usize, group: GroupId) -> Result<()> {
        self.transact("assign_row", |draft| {
            let values = draft.row_values(row)?;
            let Draft { model, touched } = draft;
            let k = kind;
            let kind = model.kind_mut(k)?;
            if !kind.groups.contains_key(&group) {
                return Err(missing_group(k, group));
            }
            if kind.group_of(row) == Some(group) {
                return Ok(());
            }
            leave(kind, k, row, &values, touched)?;
            join(kind, k, group, row, &values, touched)
        })
    }

    /// Fold `source` into `target` within one kind.
    pub fn merge_groups(&mut self, kind: usize, target: GroupId, source: GroupId) -> Result<()> {
        self.transact("merge_groups", |draft| {
            let Draft { model, touched } = draft;
            let k = kind;
            let kind = model.kind_mut(k)?;
            if target == source {
                return Err(CrossCatError::structural(format!(
                    "cannot merge group {target} of kind {k} into itself"
                )));
            }
            if !kind.groups.contains_key(&target) {
                return Err(missing_group(k, target));
            }
            let absorbed = kind
                .groups
                .remove(&source)
                .ok_or_else(|| missing_group(k, source))?;

            for assigned in kind.assignments.values_mut() {
                if *assigned == source {
                    *assigned = target;
                }
            }
            let into = kind
                .groups
                .get_mut(&target)
                .ok_or_else(|| missing_group(k, target))?;
            into.count += absorbed.count;
            for (feature, stats) in &absorbed.stats {
                let slot = into.stats.get_mut(feature).ok_or_else(|| {
                    CrossCatError::structural(format!(
                        "group {target} of kind {k} has no statistics for feature {feature}"
                    ))
                })?;
                slot.merge(stats)
                    .map_err(|e| stats_error(e, k, target, *feature))?;
                touched.push((k, target, *feature));
            }
            Ok(())
        })
    }

    /// Move `rows` out of `group` into a fresh group and return its id.
    ///
    /// `rows` must be a non-empty proper subset of the group's members.
    pub fn split_group(&mut self, kind: usize, group: GroupId, rows: &[RowId]) -> Result<GroupId> {
        self.transact("split_group", |draft| {
            let mut moving = rows.to_vec();
            moving.sort_unstable();
            moving.dedup();
            if moving.len() != rows.len() {
                return Err(CrossCatError::structural("split lists a row more than once"));
            }
            let values = moving
                .iter()
                .map(|&row| draft.row_values(row))
                .collect::<Result<Vec<_>>>()?;

            let Draft { model, touched } = draft;
            let k = kind;
            let kind = model.kind_mut(k)?;
            let size = kind
                .groups
                .get(&group)
                .ok_or_else(|| missing_group(k, group))?
                .count;
            if moving.is_empty() || moving.len() as u64 >= size {
                return Err(CrossCatError::structural(format!(
                    "split of group {group} in kind {k} must move a non-empty proper subset of its {size} rows"
                )));
            }
            if let Some(&stray) = moving.iter().find(|&&row| kind.group_of(row) != Some(group)) {
                return Err(CrossCatError::structural(format!(
                    "row {stray} is not a member of group {group} in kind {k}"
                )));
            }

            let fresh = kind.push_empty_group();
            for (&row, values) in moving.iter().zip(&values) {
                leave(kind, k, row, values, touched)?;
                join(kind, k, fresh, row, values, touched)?;
            }
            Ok(fresh)
        })
    }

    /// Hand `feature` from kind `from` to kind `to`.
    ///
    /// The shared parameters move with the feature; its statistics are
    /// dropped from `from`'s groups and rebuilt in `to`'s groups from the
    /// stored row values.
    pub fn move_feature_between_kinds(
        &mut self,
        feature: FeatureId,
        from: usize,
        to: usize,
    ) -> Result<()> {
        let result = self.transact("move_feature", |draft| {
            if from == to {
                return Err(CrossCatError::structural(format!(
                    "feature {feature} already lives in kind {from}"
                )));
            }
            let Draft { model, touched } = draft;
            model.kind_mut(to)?;
            let source = model.kind_mut(from)?;
            if !source.featureids.remove(&feature) {
                return Err(CrossCatError::structural(format!(
                    "feature {feature} is not owned by kind {from}"
                )));
            }
            let shared = source
                .shared
                .remove(&feature)
                .ok_or_else(|| CrossCatError::structural(format!(
                    "kind {from} has no shared parameters for feature {feature}"
                )))?;
            for group in source.groups.values_mut() {
                group.stats.remove(&feature);
            }

            let rows = Arc::clone(&model.rows);
            let target = model.kind_mut(to)?;
            target.adopt_feature(feature, shared);
            for (&row, values) in rows.iter() {
                let Some(value) = values.get(feature) else {
                    continue;
                };
                let group = target.group_of(row).ok_or_else(|| {
                    CrossCatError::structural(format!("row {row} has no group in kind {to}"))
                })?;
                let stats = target
                    .groups
                    .get_mut(&group)
                    .and_then(|g| g.stats.get_mut(&feature))
                    .ok_or_else(|| missing_group(to, group))?;
                stats
                    .add(value)
                    .map_err(|e| stats_error(e, to, group, feature))?;
                touched.push((to, group, feature));
            }

            let mut lookup = (*model.feature_kind).clone();
            if let Some(slot) = lookup.get_mut(feature as usize) {
                *slot = to;
            }
            model.feature_kind = Arc::new(lookup);
            Ok(())
        });
        if let Err(err) = &result {
            warn!(feature, from, to, %err, "feature move rejected");
        }
        result
    }

    // =========================================================================
    // Row mutations
    // =========================================================================

    /// Ingest a row given as a diff against the all-absent baseline.
    pub fn insert_row(&mut self, row: &Row, groupids: &[GroupId]) -> Result<()> {
        let decoded = DiffEngine::new(&self.index).decode(&row.diff)?;
        if !decoded.neg.is_empty() || !decoded.tares.is_empty() {
            return Err(CrossCatError::malformed(format!(
                "ingested row {} must not carry neg values or tares",
                row.id
            )));
        }
        self.insert_values(row.id, decoded.pos, groupids)
    }

    /// Ingest a row from its decoded values.
    pub fn insert_values(
        &mut self,
        row: RowId,
        values: FeatureValues,
        groupids: &[GroupId],
    ) -> Result<()> {
        for (&feature, value) in &values {
            self.index.check_value(feature, value)?;
        }
        self.transact("insert_row", |draft| {
            if draft.model.rows.contains_key(&row) {
                return Err(CrossCatError::structural(format!("row {row} already exists")));
            }
            let n_kinds = draft.model.crosscat.kinds.len();
            if groupids.len() != n_kinds {
                return Err(CrossCatError::structural(format!(
                    "row {row} carries {} group ids for {n_kinds} kinds",
                    groupids.len()
                )));
            }
            let Draft { model, touched } = draft;
            for (k, &group) in groupids.iter().enumerate() {
                let kind = model.kind_mut(k)?;
                if !kind.groups.contains_key(&group) {
                    return Err(missing_group(k, group));
                }
                join(kind, k, group, row, &values, touched)?;
            }
            Arc::make_mut(&mut model.rows).insert(row, values);
            Ok(())
        })
    }

    /// Apply a diff to a stored row and to the statistics of its groups.
    ///
    /// Each kind removes the `neg` values and adds the `pos` values of the
    /// features it owns. Tares leave every statistic untouched.
    pub fn update_row(&mut self, row: RowId, diff: &Diff) -> Result<()> {
        let engine = DiffEngine::new(&self.index);
        let decoded = engine.decode(diff)?;
        let baseline = self.rows.get(&row).ok_or_else(|| unknown_row(row))?;
        decoded.check_against(baseline)?;
        if decoded.is_noop() {
            return Ok(());
        }
        let updated = engine.apply_values(baseline, diff)?;

        self.transact("update_row", |draft| {
            let Draft { model, touched } = draft;
            for k in 0..model.crosscat.kinds.len() {
                let kind = model.kind_mut(k)?;
                let group = kind.group_of(row).ok_or_else(|| {
                    CrossCatError::structural(format!("row {row} has no group in kind {k}"))
                })?;
                unobserve(kind, k, group, &decoded.neg, touched)?;
                observe(kind, k, group, &decoded.pos, touched)?;
            }
            Arc::make_mut(&mut model.rows).insert(row, updated);
            Ok(())
        })
    }

    /// Remove a row from every kind and from the row table.
    pub fn remove_row(&mut self, row: RowId) -> Result<FeatureValues> {
        self.transact("remove_row", |draft| {
            let values = draft.row_values(row)?;
            let Draft { model, touched } = draft;
            for k in 0..model.crosscat.kinds.len() {
                let kind = model.kind_mut(k)?;
                leave(kind, k, row, &values, touched)?;
            }
            Arc::make_mut(&mut model.rows).remove(&row);
            Ok(values)
        })
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    /// Verify every structural invariant of the model.
    pub fn check_invariants(&self) -> Result<()> {
        check_partition(&self.index, &self.crosscat)?;
        if *self.feature_kind != feature_kinds(&self.index, &self.crosscat) {
            return Err(CrossCatError::structural("feature lookup is out of date"));
        }

        for (k, kind) in self.crosscat.kinds.iter().enumerate() {
            if kind.shared.keys().ne(kind.featureids.iter()) {
                return Err(CrossCatError::structural(format!(
                    "kind {k} shared parameters do not match its features"
                )));
            }
            for (&id, group) in &kind.groups {
                if group.stats.keys().ne(kind.featureids.iter()) {
                    return Err(CrossCatError::structural(format!(
                        "group {id} of kind {k} has statistics for foreign features"
                    )));
                }
                if id >= kind.next_group_id {
                    return Err(CrossCatError::structural(format!(
                        "group {id} of kind {k} is beyond the id allocator"
                    )));
                }
            }

            let mut members: BTreeMap<GroupId, u64> = BTreeMap::new();
            for (&row, &group) in &kind.assignments {
                if !self.rows.contains_key(&row) {
                    return Err(CrossCatError::structural(format!(
                        "kind {k} assigns unknown row {row}"
                    )));
                }
                if !kind.groups.contains_key(&group) {
                    return Err(missing_group(k, group));
                }
                *members.entry(group).or_insert(0) += 1;
            }
            if kind.assignments.len() != self.rows.len() {
                return Err(CrossCatError::structural(format!(
                    "kind {k} assigns {} of {} rows",
                    kind.assignments.len(),
                    self.rows.len()
                )));
            }
            for (&id, group) in &kind.groups {
                let expected = members.get(&id).copied().unwrap_or(0);
                if group.count != expected {
                    return Err(CrossCatError::structural(format!(
                        "group {id} of kind {k} counts {} rows but has {expected} members",
                        group.count
                    )));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    fn transact<T>(&mut self, op: &'static str, f: impl FnOnce(&mut Draft) -> Result<T>) -> Result<T> {
        let mut draft = Draft {
            model: self.clone(),
            touched: Vec::new(),
        };
        match f(&mut draft) {
            Ok(out) => {
                let Draft { mut model, touched } = draft;
                debug!(op, touched = touched.len(), "committed");
                match (&model.audit, &mut model.held) {
                    (Some(_), Some(held)) => held.extend(touched),
                    (Some(audit), None) => notify(audit.as_ref(), &touched),
                    (None, _) => {}
                }
                *self = model;
                Ok(out)
            }
            Err(err) => {
                if err.is_fatal() {
                    error!(op, %err, "group accounting diverged");
                } else {
                    debug!(op, %err, "rolled back");
                }
                Err(err)
            }
        }
    }

    fn kind_mut(&mut self, kind: usize) -> Result<&mut Kind> {
        let n = self.crosscat.kinds.len();
        self.crosscat
            .kinds
            .get_mut(kind)
            .map(Arc::make_mut)
            .ok_or_else(|| CrossCatError::structural(format!("kind {kind} out of range for {n} kinds")))
    }

    /// Rebuild the lookup cache after kinds were replaced wholesale.
    pub(crate) fn refresh_lookup(&mut self) {
        self.feature_kind = Arc::new(feature_kinds(&self.index, &self.crosscat));
    }
}

/// A model being mutated, plus the statistics it touched so far.
struct Draft {
    model: AssignmentModel,
    touched: Vec<Touch>,
}

impl Draft {
    fn row_values(&self, row: RowId) -> Result<FeatureValues> {
        self.model
            .rows
            .get(&row)
            .cloned()
            .ok_or_else(|| unknown_row(row))
    }

    fn kind_mut(&mut self, kind: usize) -> Result<&mut Kind> {
        self.model.kind_mut(kind)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn notify(audit: &dyn StatsAudit, touched: &[Touch]) {
    for &(kind, group, feature) in touched {
        trace!(kind, group, feature, "statistic touched");
        audit.touched(kind, group, feature);
    }
}

fn build_kind(index: &SchemaIndex, features: &[FeatureId], topology: Topology) -> Kind {
    let mut kind = Kind::new(topology);
    for &feature in features {
        if let Ok(family) = index.family_of(feature) {
            kind.adopt_feature(feature, SharedParams::default_for(family));
        }
    }
    kind
}

fn feature_kinds(index: &SchemaIndex, crosscat: &CrossCat) -> Vec<usize> {
    let mut lookup = vec![usize::MAX; index.total_feature_count()];
    for (k, kind) in crosscat.kinds.iter().enumerate() {
        for &feature in &kind.featureids {
            if let Some(slot) = lookup.get_mut(feature as usize) {
                *slot = k;
            }
        }
    }
    lookup
}

fn check_partition(index: &SchemaIndex, crosscat: &CrossCat) -> Result<()> {
    let n = index.total_feature_count();
    let mut owner: Vec<Option<usize>> = vec![None; n];
    for (k, kind) in crosscat.kinds.iter().enumerate() {
        for &feature in &kind.featureids {
            let slot = owner.get_mut(feature as usize).ok_or_else(|| {
                CrossCatError::structural(format!(
                    "kind {k} owns feature {feature} outside the schema"
                ))
            })?;
            if let Some(other) = slot.replace(k) {
                return Err(CrossCatError::structural(format!(
                    "feature {feature} owned by kinds {other} and {k}"
                )));
            }
            let family = index.family_of(feature)?;
            if kind.shared(feature).map(SharedParams::family) != Some(family) {
                return Err(CrossCatError::structural(format!(
                    "kind {k} holds parameters of the wrong family for feature {feature}"
                )));
            }
        }
    }
    if let Some(orphan) = owner.iter().position(Option::is_none) {
        return Err(CrossCatError::structural(format!(
            "feature {orphan} is not owned by any kind"
        )));
    }
    Ok(())
}

/// Add the values of the features `kind` owns to `group`'s statistics.
fn observe(
    kind: &mut Kind,
    k: usize,
    group: GroupId,
    values: &FeatureValues,
    touched: &mut Vec<Touch>,
) -> Result<()> {
    let g = kind.groups.get_mut(&group).ok_or_else(|| missing_group(k, group))?;
    for (&feature, value) in values {
        if let Some(stats) = g.stats.get_mut(&feature) {
            stats
                .add(value)
                .map_err(|e| stats_error(e, k, group, feature))?;
            touched.push((k, group, feature));
        }
    }
    Ok(())
}

/// Remove the values of the features `kind` owns from `group`'s statistics.
fn unobserve(
    kind: &mut Kind,
    k: usize,
    group: GroupId,
    values: &FeatureValues,
    touched: &mut Vec<Touch>,
) -> Result<()> {
    let g = kind.groups.get_mut(&group).ok_or_else(|| missing_group(k, group))?;
    for (&feature, value) in values {
        if let Some(stats) = g.stats.get_mut(&feature) {
            stats
                .remove(value)
                .map_err(|e| stats_error(e, k, group, feature))?;
            touched.push((k, group, feature));
        }
    }
    Ok(())
}

fn join(
    kind: &mut Kind,
    k: usize,
    group: GroupId,
    row: RowId,
    values: &FeatureValues,
    touched: &mut Vec<Touch>,
) -> Result<()> {
    observe(kind, k, group, values, touched)?;
    if let Some(g) = kind.groups.get_mut(&group) {
        g.count += 1;
    }
    kind.assignments.insert(row, group);
    Ok(())
}

/// Take `row` out of its group, dropping the group once it is empty.
fn leave(
    kind: &mut Kind,
    k: usize,
    row: RowId,
    values: &FeatureValues,
    touched: &mut Vec<Touch>,
) -> Result<GroupId> {
    let group = kind.assignments.remove(&row).ok_or_else(|| {
        CrossCatError::structural(format!("row {row} has no group in kind {k}"))
    })?;
    unobserve(kind, k, group, values, touched)?;
    let g = kind.groups.get_mut(&group).ok_or_else(|| missing_group(k, group))?;
    g.count = g
        .count
        .checked_sub(1)
        .ok_or(CrossCatError::Underflow { kind: k, group })?;
    if g.count == 0 {
        kind.groups.remove(&group);
    }
    Ok(group)
}

fn stats_error(err: FamilyStatsError, kind: usize, group: GroupId, feature: FeatureId) -> CrossCatError {
    match err {
        FamilyStatsError::TypeMismatch => {
            CrossCatError::schema(feature, "value does not fit the feature's statistics")
        }
        FamilyStatsError::Underflow => CrossCatError::Underflow { kind, group },
    }
}

fn missing_group(kind: usize, group: GroupId) -> CrossCatError {
    CrossCatError::structural(format!("group {group} does not exist in kind {kind}"))
}

fn unknown_row(row: RowId) -> CrossCatError {
    CrossCatError::structural(format!("row {row} does not exist"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FeatureFamily, FeatureValue, ProductSchema};
    use crate::testing::RecordingAudit;

    /// bb: 0..2, gp: 2, nich: 3.
    fn index() -> Arc<SchemaIndex> {
        Arc::new(SchemaIndex::new(
            ProductSchema::new()
                .with(FeatureFamily::BetaBernoulli, 2)
                .with(FeatureFamily::GammaPoisson, 1)
                .with(FeatureFamily::NormalInverseChiSq, 1),
        ))
    }

    fn row(b: bool, c: u32, x: f32) -> FeatureValues {
        [
            (0, FeatureValue::Boolean(b)),
            (2, FeatureValue::Count(c)),
            (3, FeatureValue::Real(x)),
        ]
        .into_iter()
        .collect()
    }

    /// Two kinds ({0, 1}, {2, 3}), two groups each, four rows.
    fn populated() -> AssignmentModel {
        let mut model =
            AssignmentModel::from_partition(index(), &[vec![0, 1], vec![2, 3]], Topology::default())
                .unwrap();
        let a0 = model.create_group(0).unwrap();
        let a1 = model.create_group(0).unwrap();
        let b0 = model.create_group(1).unwrap();
        let b1 = model.create_group(1).unwrap();
        model.insert_values(10, row(true, 1, 0.5), &[a0, b0]).unwrap();
        model.insert_values(11, row(false, 2, 1.5), &[a0, b1]).unwrap();
        model.insert_values(12, row(true, 3, -1.0), &[a1, b1]).unwrap();
        model.insert_values(13, row(true, 0, 2.0), &[a1, b0]).unwrap();
        model
    }

    #[test]
    fn populated_model_is_consistent() {
        let model = populated();
        model.check_invariants().unwrap();
        assert_eq!(model.kind_of(3).unwrap(), 1);
        assert_eq!(
            model.assignment(11).unwrap(),
            Assignment {
                rowid: 11,
                groupids: vec![0, 1]
            }
        );
        let group = model.kind(0).unwrap().group(0).unwrap();
        assert_eq!(group.count(), 2);
        assert_eq!(group.stats(0).unwrap().count(), 2);
    }

    #[test]
    fn assign_row_moves_statistics() {
        let mut model = populated();
        model.assign_row(10, 1, 1).unwrap();
        model.check_invariants().unwrap();
        let kind = model.kind(1).unwrap();
        assert_eq!(kind.group(0).unwrap().count(), 1);
        assert_eq!(kind.group(1).unwrap().count(), 3);
        assert_eq!(kind.group(1).unwrap().stats(2).unwrap().count(), 3);
    }

    #[test]
    fn assign_row_to_missing_group_rolls_back() {
        let mut model = populated();
        let before = model.clone();
        let err = model.assign_row(10, 0, 99).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(model, before);
    }

    #[test]
    fn emptied_group_is_removed() {
        let mut model = populated();
        model.assign_row(12, 0, 0).unwrap();
        model.assign_row(13, 0, 0).unwrap();
        assert!(model.kind(0).unwrap().group(1).is_none());
        model.check_invariants().unwrap();
    }

    #[test]
    fn merge_and_split_keep_counts() {
        let mut model = populated();
        model.merge_groups(1, 0, 1).unwrap();
        model.check_invariants().unwrap();
        assert_eq!(model.kind(1).unwrap().group(0).unwrap().count(), 4);

        let fresh = model.split_group(1, 0, &[11, 12]).unwrap();
        model.check_invariants().unwrap();
        assert_eq!(model.kind(1).unwrap().members(fresh), vec![11, 12]);
        assert_eq!(model.kind(1).unwrap().group(0).unwrap().count(), 2);
    }

    #[test]
    fn split_rejects_whole_group() {
        let mut model = populated();
        let before = model.clone();
        assert!(model.split_group(0, 0, &[10, 11]).is_err());
        assert!(model.split_group(0, 0, &[]).is_err());
        assert!(model.split_group(0, 0, &[12]).is_err());
        assert_eq!(model, before);
    }

    #[test]
    fn move_feature_rebuilds_statistics() {
        let mut model = populated();
        model.move_feature_between_kinds(0, 0, 1).unwrap();
        model.check_invariants().unwrap();
        assert_eq!(model.kind_of(0).unwrap(), 1);

        let kind = model.kind(1).unwrap();
        // Rows 10 and 13 sit in group 0 of kind 1; both observed feature 0.
        assert_eq!(
            kind.group(0).unwrap().stats(0),
            Some(&crate::model::FamilyStats::BetaBernoulli { heads: 2, tails: 0 })
        );
        assert!(model.kind(0).unwrap().group(0).unwrap().stats(0).is_none());
    }

    #[test]
    fn move_feature_rejects_bad_arguments() {
        let mut model = populated();
        let before = model.clone();
        assert!(model.move_feature_between_kinds(0, 1, 0).is_err());
        assert!(model.move_feature_between_kinds(0, 0, 0).is_err());
        assert!(model.move_feature_between_kinds(0, 0, 7).is_err());
        assert_eq!(model, before);
    }

    #[test]
    fn update_row_skips_tares() {
        let mut model = populated();
        let audit = Arc::new(RecordingAudit::default());
        model.set_audit(Some(audit.clone()));

        let index = Arc::clone(model.index());
        let engine = DiffEngine::new(&index);
        let updated = row(true, 5, 0.5);
        let diff = engine.compute_values(model.row(10).unwrap(), &updated).unwrap();
        model.update_row(10, &diff).unwrap();

        assert_eq!(model.row(10), Some(&updated));
        let features: Vec<FeatureId> = audit.touches().iter().map(|t| t.2).collect();
        assert_eq!(features, vec![2, 2]);
        model.check_invariants().unwrap();
    }

    #[test]
    fn remove_row_underflow_is_fatal() {
        let mut model = populated();
        // Corrupt a count directly so the next removal underflows.
        Arc::make_mut(&mut model.crosscat.kinds[0])
            .groups
            .get_mut(&0)
            .unwrap()
            .count = 0;
        let err = model.remove_row(10).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn add_kind_places_rows_together() {
        let mut model = populated();
        let k = model.add_kind(Topology::default());
        model.check_invariants().unwrap();
        assert_eq!(model.kind(k).unwrap().group_count(), 1);
        assert_eq!(model.assignment(12).unwrap().groupids.len(), 3);
    }

    #[test]
    fn from_partition_rejects_overlap() {
        assert!(AssignmentModel::from_partition(index(), &[vec![0, 1], vec![1, 2, 3]], Topology::default()).is_err());
        assert!(AssignmentModel::from_partition(index(), &[vec![0, 1, 2]], Topology::default()).is_err());
    }
}
