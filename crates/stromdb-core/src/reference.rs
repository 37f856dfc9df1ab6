//! Static location reference data (`location_id -> name, coordinates`).

use std::collections::HashMap;

use crate::model::{Coordinates, Target};

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceEntry {
    pub display_name: String,
    pub coordinates: Coordinates,
}

/// Read-only lookup of reference coordinates, loaded once per process.
pub trait ReferenceData: Send + Sync {
    fn lookup(&self, location_id: &str) -> Option<&ReferenceEntry>;

    fn coordinates(&self, location_id: &str) -> Option<Coordinates> {
        self.lookup(location_id).map(|entry| entry.coordinates)
    }
}

/// In-memory [`ReferenceData`] backed by a `HashMap`.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    entries: HashMap<String, ReferenceEntry>,
}

impl ReferenceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table from every target that carries valid coordinates.
    #[must_use]
    pub fn from_targets(targets: &[Target]) -> Self {
        let mut table = Self::new();
        for target in targets {
            if let Some(coordinates) = target.coordinates.filter(Coordinates::is_valid) {
                table.insert(&target.location_id, &target.display_name, coordinates);
            }
        }
        table
    }

    pub fn insert(&mut self, location_id: &str, display_name: &str, coordinates: Coordinates) {
        self.entries.insert(
            location_id.to_string(),
            ReferenceEntry {
                display_name: display_name.to_string(),
                coordinates,
            },
        );
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ReferenceData for ReferenceTable {
    fn lookup(&self, location_id: &str) -> Option<&ReferenceEntry> {
        self.entries.get(location_id)
    }
}
