mod counters;
mod documents;
mod reconciliation;

pub use counters::SurrealCounterStore;
pub use documents::SurrealDocumentSource;
pub use reconciliation::SurrealReconciliationLog;

use procstats_domain::DomainResult;
use procstats_domain::error::DomainError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub(crate) fn map_surreal_error(err: surrealdb::Error) -> DomainError {
    classify_surreal_message(&err.to_string())
}

/// Transaction read/write conflicts are rolled back and safe to retry; key
/// collisions are not.
fn classify_surreal_message(message: &str) -> DomainError {
    let error_message = message.to_lowercase();
    if error_message.contains("read or write conflict")
        || error_message.contains("can be retried")
        || error_message.contains("transaction conflict")
    {
        return DomainError::Transient(format!("surreal transaction conflict: {error_message}"));
    }
    if error_message.contains("already exists")
        || error_message.contains("duplicate")
        || error_message.contains("unique")
        || error_message.contains("conflict")
    {
        return DomainError::Conflict;
    }
    DomainError::Persistence(format!("surreal query failed: {error_message}"))
}

pub(crate) fn query_result_error(err: surrealdb::Error) -> DomainError {
    DomainError::Persistence(format!("invalid query result: {err}"))
}

pub(crate) fn decode_many<T>(rows: Vec<Value>, entity: &str) -> DomainResult<Vec<T>>
where
    T: DeserializeOwned,
{
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row).map_err(|err| {
                DomainError::Persistence(format!("invalid {entity} row payload: {err}"))
            })
        })
        .collect()
}

pub(crate) fn decode_one<T>(rows: Vec<Value>, entity: &str) -> DomainResult<Option<T>>
where
    T: DeserializeOwned,
{
    Ok(decode_many(rows, entity)?.into_iter().next())
}

pub(crate) fn to_rfc3339(at: OffsetDateTime) -> DomainResult<String> {
    at.format(&Rfc3339)
        .map_err(|err| DomainError::Validation(format!("invalid timestamp: {err}")))
}
