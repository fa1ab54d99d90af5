//! Extract → flatten → incremental load orchestration for qpsync.

pub mod config;
pub mod db;
pub mod export;
pub mod load;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use qpsync_adapters::{
    api_base_url, extract_all, fetch_all, flatten, Extraction, ExtractionHalt, FlattenOptions,
    ResponsePageSource,
};
use qpsync_core::{FlattenStats, RowSet};
use qpsync_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, StoredArtifact};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigError, DatabaseConfig, Secret, SyncConfig};
pub use db::{connect, ColumnType, ConnectError, PgDestination, TableColumn};
pub use load::{load, plan_inserts, DestinationTable, InsertError, LoadReport};

pub const CRATE_NAME: &str = "qpsync-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub survey_id: String,
    pub table: String,
    pub pages_fetched: u32,
    /// `totalPages` as last reported by the API.
    pub total_pages: Option<u32>,
    pub responses_fetched: usize,
    pub halted: Option<ExtractionHalt>,
    pub rows_flattened: usize,
    pub flatten: FlattenStats,
    pub load: LoadReport,
}

impl SyncRunSummary {
    pub fn headline(&self) -> String {
        let line = format!(
            "sync complete: run_id={} fetched={} rows={} dropped={} inserted={} duplicates={} failed={}",
            self.run_id,
            self.responses_fetched,
            self.rows_flattened,
            self.flatten.dropped_unparsable,
            self.load.inserted,
            self.load.duplicates,
            self.load.failed,
        );
        with_halt(line, self.halted.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub extraction: Extraction,
    pub rows: RowSet,
    pub load: LoadReport,
}

/// Extract every page from `source` and flatten the result.
pub async fn extract_and_flatten<S>(
    source: &S,
    options: &FlattenOptions,
) -> Result<(Extraction, RowSet)>
where
    S: ResponsePageSource + ?Sized,
{
    let extraction = extract_all(source)
        .await
        .with_context(|| format!("extracting responses for survey {}", source.survey_id()))?;
    let rows = flatten(&extraction.responses, options);
    Ok((extraction, rows))
}

/// Extract, flatten, and load into `dest`.
pub async fn run_pipeline<S, D>(
    source: &S,
    dest: D,
    options: &FlattenOptions,
) -> Result<PipelineOutcome>
where
    S: ResponsePageSource + ?Sized,
    D: DestinationTable,
{
    let (extraction, rows) = extract_and_flatten(source, options).await?;
    let load = load::load(&rows, dest).await.context("loading flattened responses")?;
    Ok(PipelineOutcome {
        extraction,
        rows,
        load,
    })
}

fn with_halt(mut line: String, halted: Option<&ExtractionHalt>) -> String {
    if let Some(halt) = halted {
        line.push_str(&format!(" ({})", halt.describe()));
    }
    line
}

#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub responses_fetched: usize,
    pub pages_fetched: u32,
    pub stored: StoredArtifact,
    pub halted: Option<ExtractionHalt>,
}

impl ArchiveSummary {
    pub fn headline(&self) -> String {
        let line = format!(
            "extract complete: responses={} pages={} path={}{}",
            self.responses_fetched,
            self.pages_fetched,
            self.stored.absolute_path.display(),
            if self.stored.deduplicated { " (unchanged)" } else { "" }
        );
        with_halt(line, self.halted.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub responses_fetched: usize,
    pub rows: usize,
    pub manifest_path: PathBuf,
    pub halted: Option<ExtractionHalt>,
}

impl ExportSummary {
    pub fn headline(&self) -> String {
        let line = format!(
            "export complete: responses={} rows={} manifest={}",
            self.responses_fetched,
            self.rows,
            self.manifest_path.display()
        );
        with_halt(line, self.halted.as_ref())
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    artifact_store: ArtifactStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        Ok(Self {
            config,
            http,
            artifact_store,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn flatten_options(&self) -> FlattenOptions {
        FlattenOptions {
            identity: self.config.identity,
            timezone_marker: self.config.timezone_marker.clone(),
        }
    }

    pub async fn extract(&self) -> Result<Extraction> {
        fetch_all(
            &self.http,
            &api_base_url(&self.config.api_env),
            &self.config.survey_id,
            self.config.api_key.expose(),
        )
        .await
        .with_context(|| format!("extracting responses for survey {}", self.config.survey_id))
    }

    pub async fn extract_and_flatten(&self) -> Result<(Extraction, RowSet)> {
        let extraction = self.extract().await?;
        let rows = flatten(&extraction.responses, &self.flatten_options());
        Ok((extraction, rows))
    }

    /// Connect, run the full pipeline, and close the pool on every path.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, survey_id = %self.config.survey_id);
        async {
            let started_at = Utc::now();
            let pool = db::connect(&self.config.db).await?;
            let outcome = self.run_with_pool(&pool).await;
            pool.close().await;
            let outcome = outcome?;

            if let Some(halt) = &outcome.extraction.halted {
                warn!(page = halt.page, status = halt.status, "run finished with a partial extraction");
            }

            Ok::<_, anyhow::Error>(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                survey_id: self.config.survey_id.clone(),
                table: self.config.db.table_name.clone(),
                pages_fetched: outcome.extraction.pages_fetched,
                total_pages: outcome.extraction.total_pages,
                responses_fetched: outcome.extraction.responses.len(),
                halted: outcome.extraction.halted.clone(),
                rows_flattened: outcome.rows.len(),
                flatten: outcome.rows.stats,
                load: outcome.load,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_with_pool(&self, pool: &PgPool) -> Result<PipelineOutcome> {
        // Extraction runs before the load transaction opens.
        let (extraction, rows) = self.extract_and_flatten().await?;
        let dest = PgDestination::begin(pool, self.config.db.table_name.clone()).await?;
        let load = load::load(&rows, dest).await.context("loading flattened responses")?;
        Ok(PipelineOutcome {
            extraction,
            rows,
            load,
        })
    }

    /// Fetch everything and keep the raw payload in the artifact store.
    pub async fn archive_raw(&self) -> Result<ArchiveSummary> {
        let extraction = self.extract().await?;
        let stored = self
            .artifact_store
            .store_json(Utc::now(), &self.config.survey_id, &extraction.responses)
            .await?;
        info!(
            path = %stored.absolute_path.display(),
            deduplicated = stored.deduplicated,
            "archived raw responses"
        );
        Ok(ArchiveSummary {
            responses_fetched: extraction.responses.len(),
            pages_fetched: extraction.pages_fetched,
            stored,
            halted: extraction.halted,
        })
    }

    pub async fn export_parquet(&self, out_dir: &Path) -> Result<ExportSummary> {
        let (extraction, rows) = self.extract_and_flatten().await?;
        let manifest_path = export::export_rowset(&rows, &self.config.survey_id, out_dir)?;
        Ok(ExportSummary {
            responses_fetched: extraction.responses.len(),
            rows: rows.len(),
            manifest_path,
            halted: extraction.halted,
        })
    }

    /// Connect with retry and list the destination table's columns.
    pub async fn inspect_table(&self) -> Result<Vec<TableColumn>> {
        let pool = db::connect(&self.config.db).await?;
        let columns = async {
            let mut conn = pool.acquire().await.context("acquiring connection")?;
            db::table_columns(&mut *conn, &self.config.db.table_name).await
        }
        .await;
        pool.close().await;
        columns
    }
}
