use crate::models::SourceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Keyed lock table: one mutex per data source.
///
/// Queues admissions for the same source inside one process so they reach the
/// ledger one at a time. Sources never share a mutex, so they never wait on
/// each other here.
#[derive(Debug, Default)]
pub struct SourceLocks {
    table: Mutex<HashMap<SourceId, Arc<Mutex<()>>>>,
}

impl SourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex guarding admission for `source_id`. Lock it and keep the
    /// guard alive for the whole critical section.
    pub fn for_source(&self, source_id: SourceId) -> Arc<Mutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.entry(source_id).or_default().clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
