use std::sync::Arc;

use procstats_domain::DomainResult;
use procstats_domain::error::DomainError;
use procstats_domain::ports::BoxFuture;
use procstats_domain::ports::reconciliation::{ReconciliationLog, ReconciliationQuery};
use procstats_domain::reconciliation::ReconciliationRecord;
use serde_json::{Value, to_value};
use surrealdb::{Surreal, engine::remote::ws::Client};

use super::{decode_many, decode_one, map_surreal_error, query_result_error};

/// Append-only: records are created once and never updated.
pub struct SurrealReconciliationLog {
    client: Arc<Surreal<Client>>,
}

impl SurrealReconciliationLog {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }
}

impl ReconciliationLog for SurrealReconciliationLog {
    fn append(
        &self,
        record: &ReconciliationRecord,
    ) -> BoxFuture<'_, DomainResult<ReconciliationRecord>> {
        let record = record.clone();
        Box::pin(async move {
            let payload = to_value(&record).map_err(|err| {
                DomainError::Validation(format!("invalid reconciliation payload: {err}"))
            })?;
            self.client
                .query("CREATE type::record('stats_reconciliation', $audit_id) CONTENT $payload")
                .bind(("audit_id", record.audit_id.clone()))
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?
                .check()
                .map_err(map_surreal_error)?;
            Ok(record)
        })
    }

    fn get(&self, audit_id: &str) -> BoxFuture<'_, DomainResult<Option<ReconciliationRecord>>> {
        let audit_id = audit_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query("SELECT * OMIT id FROM type::record('stats_reconciliation', $audit_id)")
                .bind(("audit_id", audit_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            decode_one(rows, "stats_reconciliation")
        })
    }

    fn list(
        &self,
        query: &ReconciliationQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<ReconciliationRecord>>> {
        let query = query.clone();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT *, <datetime> executed_at AS executed_sort OMIT id \
                     FROM stats_reconciliation \
                     WHERE ($any_city OR city_code = $city_code) \
                       AND ($open_start OR date >= $start) \
                       AND ($open_end OR date <= $end) \
                     ORDER BY executed_sort DESC \
                     LIMIT $limit",
                )
                .bind(("any_city", query.city_code.is_none()))
                .bind(("city_code", query.city_code.clone().unwrap_or_default()))
                .bind(("open_start", query.start.is_none()))
                .bind((
                    "start",
                    query.start.map(|date| date.to_string()).unwrap_or_default(),
                ))
                .bind(("open_end", query.end.is_none()))
                .bind((
                    "end",
                    query.end.map(|date| date.to_string()).unwrap_or_default(),
                ))
                .bind(("limit", query.limit as u64))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            decode_many(rows, "stats_reconciliation")
        })
    }
}
