use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::BoxFuture;
use crate::DomainResult;
use crate::stats::ResultType;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Escalated,
    Failed,
}

/// One authoritative per-document record owned by the processing pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub document_id: String,
    pub city_code: String,
    pub status: DocumentStatus,
    #[serde(default)]
    pub auto_approved: bool,
    pub processing_duration_seconds: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

impl DocumentRecord {
    /// Terminal outcome of this document, `None` while it is still in flight.
    pub fn result_type(&self) -> Option<ResultType> {
        match self.status {
            DocumentStatus::Completed if self.auto_approved => Some(ResultType::AutoApproved),
            DocumentStatus::Completed => Some(ResultType::ManualReviewed),
            DocumentStatus::Escalated => Some(ResultType::Escalated),
            DocumentStatus::Failed => Some(ResultType::Failed),
            DocumentStatus::Pending | DocumentStatus::Processing => None,
        }
    }
}

pub trait DocumentSource: Send + Sync {
    /// Documents of `city_code` processed within `[start, end)`.
    fn list_documents(
        &self,
        city_code: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<Vec<DocumentRecord>>>;

    fn list_active_cities(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<Vec<String>>>;
}
