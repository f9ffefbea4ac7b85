//! Concurrent access to an [`AssignmentModel`].
//!
//! Readers take frozen snapshots; writers commit through per-kind permits.
//!
//! ```text
//! reader:  snapshot() ─────────────► Arc<AssignmentModel> (never changes)
//! writer:  commit(&[2, 0], op)
//!            lock permit 0, then 2      (ascending order)
//!            draft = snapshot clone
//!            op(&mut draft)?            (may only touch kinds 0 and 2)
//!            splice kinds 0, 2 into latest published model
//! ```
//!
//! Writers on disjoint kinds run concurrently. Operations that change the
//! row table or the feature-level topology must declare every kind. The
//! number of kinds is fixed once the model is shared.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use super::AssignmentModel;
use crate::error::{CrossCatError, Result};

/// A published model plus its write permits.
#[derive(Debug)]
pub struct SharedModel {
    published: RwLock<Arc<AssignmentModel>>,
    permits: Vec<Mutex<()>>,
}

impl SharedModel {
    /// Publish `model`. The number of permits is fixed to its kind count.
    pub fn new(model: AssignmentModel) -> Self {
        let permits = (0..model.kind_count()).map(|_| Mutex::new(())).collect();
        Self {
            published: RwLock::new(Arc::new(model)),
            permits,
        }
    }

    /// Frozen view of the latest published model.
    pub fn snapshot(&self) -> Arc<AssignmentModel> {
        Arc::clone(&self.published.read())
    }

    #[inline]
    pub fn kind_count(&self) -> usize {
        self.permits.len()
    }

    /// Run `op` against a draft and publish the result.
    ///
    /// `kinds` lists the kinds `op` is allowed to modify. Their permits are
    /// held, in ascending order, until the result is published. If `op`
    /// fails, or touches a kind it did not declare, nothing is published.
    /// The model's audit hears the touches of `op` only once it is published.
    ///
    /// # Arguments
    ///
    /// * `kinds` - Kind indices to lock, in any order; duplicates are ignored.
    /// * `op` - Mutation to stage on the draft.
    pub fn commit<T>(
        &self,
        kinds: &[usize],
        op: impl FnOnce(&mut AssignmentModel) -> Result<T>,
    ) -> Result<T> {
        let mut declared = kinds.to_vec();
        declared.sort_unstable();
        declared.dedup();
        if let Some(&bad) = declared.iter().find(|&&k| k >= self.permits.len()) {
            return Err(CrossCatError::structural(format!(
                "kind {bad} out of range for {} kinds",
                self.permits.len()
            )));
        }

        let _guards: Vec<MutexGuard<'_, ()>> =
            declared.iter().map(|&k| self.permits[k].lock()).collect();
        let exclusive = declared.len() == self.permits.len();

        let base = self.snapshot();
        let mut draft = (*base).clone();
        draft.hold_audit();
        let out = op(&mut draft)?;

        if let Err(err) = check_footprint(&base, &draft, &declared, exclusive) {
            warn!(?declared, %err, "commit touched undeclared state");
            return Err(err);
        }

        let mut published = self.published.write();
        let mut next = if exclusive {
            draft.clone()
        } else {
            // Writers holding other permits may have published since `base`.
            let mut latest = (**published).clone();
            for &k in &declared {
                latest.crosscat.kinds[k] = Arc::clone(&draft.crosscat.kinds[k]);
            }
            latest.refresh_lookup();
            latest
        };
        next.discard_audit();
        *published = Arc::new(next);
        drop(published);
        debug!(?declared, "published");

        // Permits are still held, so audits of one kind arrive in commit order.
        draft.release_audit();
        Ok(out)
    }
}

/// Verify that `draft` differs from `base` only in the declared kinds.
fn check_footprint(
    base: &AssignmentModel,
    draft: &AssignmentModel,
    declared: &[usize],
    exclusive: bool,
) -> Result<()> {
    if draft.kind_count() != base.kind_count() {
        return Err(CrossCatError::structural(
            "the number of kinds is fixed while shared",
        ));
    }
    if exclusive {
        return Ok(());
    }
    if !Arc::ptr_eq(&draft.rows, &base.rows) {
        return Err(CrossCatError::structural(
            "row table changes require every permit",
        ));
    }
    if draft.crosscat.topology != base.crosscat.topology
        || draft.crosscat.hyper_prior != base.crosscat.hyper_prior
    {
        return Err(CrossCatError::structural(
            "feature-level topology changes require every permit",
        ));
    }
    for (k, (before, after)) in base.crosscat.kinds.iter().zip(&draft.crosscat.kinds).enumerate() {
        if declared.binary_search(&k).is_err() && !Arc::ptr_eq(before, after) {
            return Err(CrossCatError::structural(format!(
                "kind {k} was modified without its permit"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topology;
    use crate::schema::{FeatureFamily, ProductSchema, SchemaIndex};
    use crate::testing::RecordingAudit;
    use crate::value::FeatureValues;

    fn shared() -> SharedModel {
        let index = Arc::new(SchemaIndex::new(
            ProductSchema::new().with(FeatureFamily::BetaBernoulli, 4),
        ));
        let mut model =
            AssignmentModel::from_partition(index, &[vec![0, 1], vec![2, 3]], Topology::default())
                .unwrap();
        let a = model.create_group(0).unwrap();
        let b = model.create_group(1).unwrap();
        for row in 0..4 {
            let mut values = FeatureValues::new();
            values.insert(row as u32 % 4, row % 2 == 0);
            model.insert_values(row, values, &[a, b]).unwrap();
        }
        SharedModel::new(model)
    }

    #[test]
    fn snapshot_is_frozen() {
        let shared = shared();
        let before = shared.snapshot();
        shared
            .commit(&[0], |m| m.create_group(0).map(|_| ()))
            .unwrap();
        assert_eq!(before.kind(0).unwrap().group_count(), 1);
        assert_eq!(shared.snapshot().kind(0).unwrap().group_count(), 2);
    }

    #[test]
    fn undeclared_kind_is_rejected() {
        let shared = shared();
        let before = shared.snapshot();
        let err = shared
            .commit(&[0], |m| m.create_group(1).map(|_| ()))
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(*shared.snapshot(), *before);
    }

    #[test]
    fn audit_hears_only_published_commits() {
        let audit = Arc::new(RecordingAudit::default());
        let mut model = (*shared().snapshot()).clone();
        model.set_audit(Some(audit.clone()));
        let shared = SharedModel::new(model);
        let target = shared.commit(&[1], |m| m.create_group(1)).unwrap();

        // Row 2 observes feature 2, owned by kind 1, but only kind 0 is declared.
        assert!(shared.commit(&[0], |m| m.assign_row(2, 1, target)).is_err());
        assert!(audit.touches().is_empty());

        shared.commit(&[1], |m| m.assign_row(2, 1, target)).unwrap();
        let touches = audit.touches();
        assert!(!touches.is_empty());
        assert!(touches.iter().all(|&(kind, _, _)| kind == 1));
        assert!(touches.contains(&(1, target, 2)));
        assert_eq!(shared.snapshot().kind(1).unwrap().group_of(2), Some(target));

        // Failed ops after a publish add nothing either.
        assert!(shared.commit(&[1], |m| m.assign_row(2, 1, 99)).is_err());
        assert_eq!(audit.touches(), touches);
    }

    #[test]
    fn row_changes_need_every_permit() {
        let shared = shared();
        assert!(shared.commit(&[0], |m| m.remove_row(0).map(|_| ())).is_err());
        shared
            .commit(&[1, 0], |m| m.remove_row(0).map(|_| ()))
            .unwrap();
        assert_eq!(shared.snapshot().row_count(), 3);
    }

    #[test]
    fn global_topology_needs_every_permit() {
        let shared = shared();
        let before = shared.snapshot();
        let raise = |m: &mut AssignmentModel| {
            m.crosscat.topology.alpha = 3.0;
            Ok(())
        };
        assert!(shared.commit(&[0], raise).is_err());
        assert!(Arc::ptr_eq(&before, &shared.snapshot()));

        shared.commit(&[0, 1], raise).unwrap();
        assert_eq!(shared.snapshot().crosscat().topology.alpha, 3.0);
    }

    #[test]
    fn failed_op_publishes_nothing() {
        let shared = shared();
        let before = shared.snapshot();
        assert!(shared.commit(&[0], |m| m.assign_row(0, 0, 42)).is_err());
        assert!(Arc::ptr_eq(&before, &shared.snapshot()));
    }

    #[test]
    fn disjoint_writers_both_land() {
        let shared = Arc::new(shared());
        std::thread::scope(|s| {
            for k in 0..2 {
                let shared = Arc::clone(&shared);
                s.spawn(move || {
                    for _ in 0..10 {
                        shared.commit(&[k], |m| m.create_group(k).map(|_| ())).unwrap();
                    }
                });
            }
        });
        let model = shared.snapshot();
        model.check_invariants().unwrap();
        assert_eq!(model.kind(0).unwrap().group_count(), 11);
        assert_eq!(model.kind(1).unwrap().group_count(), 11);
    }
}
