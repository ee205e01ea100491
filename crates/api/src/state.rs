use std::sync::Arc;

use procstats_domain::aggregation::AggregationService;
use procstats_domain::ports::db::DbAdapter;
use procstats_domain::reconciliation::ReconciliationService;
use procstats_domain::recording::StatsRecorder;
use procstats_infra::config::AppConfig;
use procstats_infra::services::{StatsBackends, StatsServices};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub recorder: StatsRecorder,
    pub aggregation: AggregationService,
    pub reconciliation: ReconciliationService,
    pub db: Arc<dyn DbAdapter>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let backends = StatsBackends::connect(&config).await?;
        Self::from_backends(config, &backends)
    }

    pub fn from_backends(config: AppConfig, backends: &StatsBackends) -> anyhow::Result<Self> {
        let services = StatsServices::build(backends, &config)?;
        Ok(Self {
            config,
            recorder: services.recorder,
            aggregation: services.aggregation,
            reconciliation: services.reconciliation,
            db: backends.db.clone(),
        })
    }
}
