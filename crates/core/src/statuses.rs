//! Status registry: the ordered, per-container list of request statuses.
//!
//! Besides the administrator-defined statuses, every container carries one
//! fixed system status, the shopping cart ("Not Yet Submitted"). It is created
//! lazily the first time statuses are listed, always sorts first, cannot be
//! deleted and cannot be modified.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use srt_types::Label;

use crate::error::{RequestError, RequestResult};
use crate::model::{ContainerId, Status, StatusId};
use crate::store::StudyStore;

/// Field changes for [`StatusRegistry::update`]. `None` leaves a field as is.
#[derive(Clone, Debug, Default)]
pub struct StatusUpdate {
    pub label: Option<Label>,
    pub is_final_state: Option<bool>,
    pub locks_specimens: Option<bool>,
}

/// Ordered status list of one container.
pub struct StatusRegistry {
    store: Arc<StudyStore>,
    container: ContainerId,
}

impl StatusRegistry {
    pub fn new(store: Arc<StudyStore>, container: ContainerId) -> Self {
        Self { store, container }
    }

    /// All statuses ordered by sort order, the system status first.
    ///
    /// Creates the system status if the container does not have one yet.
    pub fn list(&self) -> Vec<Status> {
        {
            let state = self.store.read();
            let statuses = state.statuses_sorted(self.container);
            if statuses.first().map(|s| s.is_system_status).unwrap_or(false) {
                return statuses;
            }
        }
        let mut state = self.store.write();
        state.ensure_system_status(self.container);
        state.statuses_sorted(self.container)
    }

    /// The fixed shopping-cart status.
    pub fn shopping_cart_status(&self) -> Status {
        let mut state = self.store.write();
        let id = state.ensure_system_status(self.container);
        state
            .status(self.container, id)
            .cloned()
            .unwrap_or_else(|| unreachable!("system status exists after ensure"))
    }

    /// The status a request enters when it leaves the shopping cart: the
    /// first non-system status in sort order.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] when no post-submission status has
    /// been configured yet.
    pub fn initial_post_submission_status(&self) -> RequestResult<Status> {
        self.store
            .read()
            .initial_post_submission_status(self.container)
            .ok_or_else(|| {
                RequestError::validation(
                    "no request status beyond the shopping cart has been configured",
                )
            })
    }

    pub fn status(&self, id: StatusId) -> Option<Status> {
        self.store.read().status(self.container, id).cloned()
    }

    /// Creates a new status appended at the end of the order.
    pub fn create(&self, label: Label) -> RequestResult<Status> {
        let mut state = self.store.write();
        state.ensure_system_status(self.container);
        let sort_order = state
            .statuses_sorted(self.container)
            .iter()
            .filter(|s| !s.is_system_status)
            .map(|s| s.sort_order + 1)
            .max()
            .unwrap_or(0);
        let id = StatusId(state.allocate_id());
        let status = Status {
            id,
            container: self.container,
            label,
            sort_order,
            is_final_state: false,
            locks_specimens: false,
            is_system_status: false,
        };
        state.statuses.insert(id, status.clone());
        Ok(status)
    }

    /// Applies the given changes to a status.
    ///
    /// Mutating a non-existent id is a no-op, tolerating stale client state.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] when the target is the system
    /// status: its label and flags are fixed.
    pub fn update(&self, id: StatusId, changes: StatusUpdate) -> RequestResult<()> {
        let mut state = self.store.write();
        let Some(existing) = state.status(self.container, id).cloned() else {
            return Ok(());
        };
        if existing.is_system_status {
            return Err(RequestError::validation(
                "the system status cannot be modified",
            ));
        }
        let updated = Status {
            label: changes.label.unwrap_or(existing.label.clone()),
            is_final_state: changes.is_final_state.unwrap_or(existing.is_final_state),
            locks_specimens: changes.locks_specimens.unwrap_or(existing.locks_specimens),
            ..existing
        };
        state.statuses.insert(id, updated);
        Ok(())
    }

    /// Reassigns sort orders so that each given id takes its index in the
    /// sequence.
    ///
    /// Ids that do not resolve to an existing, non-system status are left
    /// untouched, which tolerates partial payloads; the system status keeps
    /// its fixed slot ahead of the sequence. The id-to-status map is
    /// snapshotted once before the loop.
    pub fn reorder(&self, ordered_ids: &[StatusId]) -> RequestResult<()> {
        let mut state = self.store.write();
        state.ensure_system_status(self.container);
        let by_id: HashMap<StatusId, Status> = state
            .statuses_sorted(self.container)
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        for (index, id) in ordered_ids.iter().enumerate() {
            let Some(status) = by_id.get(id) else { continue };
            if status.is_system_status {
                continue;
            }
            let sort_order = index as i32;
            if status.sort_order != sort_order {
                let mut updated = status.clone();
                updated.sort_order = sort_order;
                state.statuses.insert(*id, updated);
            }
        }
        Ok(())
    }

    /// Deletes a status and re-indexes the remaining ones to a contiguous
    /// sequence, preserving relative order.
    ///
    /// Deleting a non-existent id is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] for the system status, or when
    /// live requests still occupy the status.
    pub fn delete(&self, id: StatusId) -> RequestResult<()> {
        let mut state = self.store.write();
        let Some(status) = state.status(self.container, id).cloned() else {
            return Ok(());
        };
        if status.is_system_status {
            return Err(RequestError::validation(
                "the system status cannot be deleted",
            ));
        }
        if self.statuses_in_use_locked(&state).contains(&id) {
            return Err(RequestError::Validation(format!(
                "status '{}' is in use by one or more requests and cannot be deleted",
                status.label
            )));
        }

        state.statuses.remove(&id);
        let remaining: Vec<Status> = state
            .statuses_sorted(self.container)
            .into_iter()
            .filter(|s| !s.is_system_status)
            .collect();
        for (index, status) in remaining.into_iter().enumerate() {
            let sort_order = index as i32;
            if status.sort_order != sort_order {
                let mut updated = status.clone();
                updated.sort_order = sort_order;
                state.statuses.insert(status.id, updated);
            }
        }
        Ok(())
    }

    /// Ids of statuses currently occupied by at least one request.
    pub fn statuses_in_use(&self) -> BTreeSet<StatusId> {
        let state = self.store.read();
        self.statuses_in_use_locked(&state)
    }

    fn statuses_in_use_locked(&self, state: &crate::store::StoreState) -> BTreeSet<StatusId> {
        state
            .requests
            .values()
            .filter(|r| r.container == self.container)
            .map(|r| r.status_id)
            .collect()
    }
}
