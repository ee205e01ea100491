use time::Date;

use super::BoxFuture;
use crate::DomainResult;
use crate::reconciliation::ReconciliationRecord;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconciliationQuery {
    pub city_code: Option<String>,
    pub start: Option<Date>,
    pub end: Option<Date>,
    pub limit: usize,
}

/// Append-only audit trail of verification runs.
pub trait ReconciliationLog: Send + Sync {
    fn append(
        &self,
        record: &ReconciliationRecord,
    ) -> BoxFuture<'_, DomainResult<ReconciliationRecord>>;

    fn get(&self, audit_id: &str) -> BoxFuture<'_, DomainResult<Option<ReconciliationRecord>>>;

    /// Newest first.
    fn list(
        &self,
        query: &ReconciliationQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<ReconciliationRecord>>>;
}
