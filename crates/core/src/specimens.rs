//! Read-only boundary to the specimen repository.
//!
//! Vials are owned by the host application's specimen store; this core only
//! consumes the requestability-relevant projection defined here. The one
//! write-shaped operation in the whole lifecycle, the administrative cleanup
//! of vials that no longer resolve, removes this core's own mapping rows and
//! never touches the repository.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use crate::model::{ContainerId, SiteId};

/// The fixed columns every vial exposes, by name. Custom requestability rules
/// may additionally reference administrator-defined columns; referencing a
/// column outside this set plus the repository's extra columns is a rule
/// configuration error.
pub const BASE_VIAL_COLUMNS: [&str; 4] = [
    "GlobalUniqueId",
    "Available",
    "AtRepository",
    "Requestable",
];

/// The requestability-relevant projection of a physical specimen aliquot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vial {
    pub row_id: i64,
    pub global_unique_id: String,
    pub container: ContainerId,
    /// Where the vial currently sits, when known.
    pub current_location_id: Option<SiteId>,
    /// The site the vial was originally drawn at, when known.
    pub originating_location_id: Option<SiteId>,
    /// Raw availability flag from the specimen data feed. This is the verdict
    /// of last resort when every requestability rule abstains.
    pub available: bool,
    pub at_repository: bool,
    /// Tri-state administrator override column: `None` means the
    /// administrator has expressed no opinion.
    pub requestable: Option<bool>,
    /// Administrator-defined extra columns, keyed by column name.
    pub attributes: BTreeMap<String, String>,
}

/// Read-only access to the host's specimen store.
pub trait SpecimenRepository: Send + Sync {
    /// Resolves a vial by its global unique id, or `None` when no physical
    /// specimen with that id exists (any longer).
    fn vial(&self, container: ContainerId, global_unique_id: &str) -> Option<Vial>;

    /// The set of column names custom requestability rules may reference.
    fn column_names(&self, container: ContainerId) -> BTreeSet<String>;

    /// Resolves each id in order, skipping ids that no longer exist.
    fn vials_by_ids(&self, container: ContainerId, global_unique_ids: &[String]) -> Vec<Vial> {
        global_unique_ids
            .iter()
            .filter_map(|id| self.vial(container, id))
            .collect()
    }
}

/// In-memory [`SpecimenRepository`] used by embedding hosts and tests.
#[derive(Default)]
pub struct InMemorySpecimenVault {
    inner: RwLock<VaultState>,
}

#[derive(Default)]
struct VaultState {
    vials: HashMap<(ContainerId, String), Vial>,
    extra_columns: BTreeMap<ContainerId, BTreeSet<String>>,
}

impl InMemorySpecimenVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, VaultState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, VaultState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces a vial. Attribute names are registered as known
    /// columns for the vial's container.
    pub fn put_vial(&self, vial: Vial) {
        let mut state = self.write();
        let columns = state.extra_columns.entry(vial.container).or_default();
        for name in vial.attributes.keys() {
            columns.insert(name.clone());
        }
        state
            .vials
            .insert((vial.container, vial.global_unique_id.clone()), vial);
    }

    /// Removes a vial, simulating a specimen that disappeared from a later
    /// data feed. Returns whether anything was removed.
    pub fn remove_vial(&self, container: ContainerId, global_unique_id: &str) -> bool {
        self.write()
            .vials
            .remove(&(container, global_unique_id.to_owned()))
            .is_some()
    }

    /// Registers an administrator-defined column name without requiring a
    /// vial to carry it yet.
    pub fn define_column(&self, container: ContainerId, name: impl Into<String>) {
        self.write()
            .extra_columns
            .entry(container)
            .or_default()
            .insert(name.into());
    }
}

impl SpecimenRepository for InMemorySpecimenVault {
    fn vial(&self, container: ContainerId, global_unique_id: &str) -> Option<Vial> {
        self.read()
            .vials
            .get(&(container, global_unique_id.to_owned()))
            .cloned()
    }

    fn column_names(&self, container: ContainerId) -> BTreeSet<String> {
        let mut columns: BTreeSet<String> =
            BASE_VIAL_COLUMNS.iter().map(|c| (*c).to_owned()).collect();
        if let Some(extra) = self.read().extra_columns.get(&container) {
            columns.extend(extra.iter().cloned());
        }
        columns
    }
}
