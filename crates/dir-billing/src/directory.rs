//! Business directory boundary
//!
//! The directory CRUD surface lives outside this core; the saga only
//! needs to confirm a payment target exists.

use dashmap::DashMap;
use dir_common::BusinessId;

/// Lookup seam into the surrounding directory platform.
pub trait BusinessDirectory: Send + Sync {
    /// Whether the business is on record.
    fn exists(&self, business_id: BusinessId) -> bool;
}

/// In-memory directory for embedding and tests.
pub struct MemoryDirectory {
    known: DashMap<BusinessId, String>,
}

impl MemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self {
            known: DashMap::new(),
        }
    }

    /// Register a business by display name.
    pub fn register(&self, business_id: BusinessId, name: impl Into<String>) {
        self.known.insert(business_id, name.into());
    }

    /// Display name of a registered business.
    pub fn name(&self, business_id: BusinessId) -> Option<String> {
        self.known.get(&business_id).map(|n| n.clone())
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl BusinessDirectory for MemoryDirectory {
    fn exists(&self, business_id: BusinessId) -> bool {
        self.known.contains_key(&business_id)
    }
}
