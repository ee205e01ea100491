use std::sync::Arc;

use procstats_domain::DomainResult;
use procstats_domain::ports::BoxFuture;
use procstats_domain::ports::documents::{DocumentRecord, DocumentSource};
use serde::Deserialize;
use serde_json::Value;
use surrealdb::{Surreal, engine::remote::ws::Client};
use time::OffsetDateTime;

use super::{decode_many, map_surreal_error, query_result_error, to_rfc3339};

/// Read-only view over the pipeline's per-document table.
pub struct SurrealDocumentSource {
    client: Arc<Surreal<Client>>,
}

impl SurrealDocumentSource {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct ActiveCityRow {
    city_code: String,
}

impl DocumentSource for SurrealDocumentSource {
    fn list_documents(
        &self,
        city_code: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<Vec<DocumentRecord>>> {
        let city_code = city_code.to_string();
        Box::pin(async move {
            let start = to_rfc3339(start)?;
            let end = to_rfc3339(end)?;
            let mut response = self
                .client
                .query(
                    "SELECT document_id, city_code, status, auto_approved, \
                            processing_duration_seconds, \
                            <string> <datetime> processed_at AS processed_at \
                     FROM processed_document \
                     WHERE city_code = $city_code \
                       AND <datetime> processed_at >= <datetime> $start \
                       AND <datetime> processed_at < <datetime> $end",
                )
                .bind(("city_code", city_code))
                .bind(("start", start))
                .bind(("end", end))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            decode_many(rows, "processed_document")
        })
    }

    fn list_active_cities(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        Box::pin(async move {
            let start = to_rfc3339(start)?;
            let end = to_rfc3339(end)?;
            let mut response = self
                .client
                .query(
                    "SELECT city_code FROM processed_document \
                     WHERE <datetime> processed_at >= <datetime> $start \
                       AND <datetime> processed_at < <datetime> $end \
                     GROUP BY city_code",
                )
                .bind(("start", start))
                .bind(("end", end))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            let mut cities: Vec<String> =
                decode_many::<ActiveCityRow>(rows, "processed_document")?
                    .into_iter()
                    .map(|row| row.city_code)
                    .collect();
            cities.sort();
            Ok(cities)
        })
    }
}
