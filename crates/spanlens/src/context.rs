use rusqlite::Connection;
use spanlens_core::config::{Config, ResolvedEmbedding};
use spanlens_core::constants;
use spanlens_core::error::StateError;
use spanlens_enrich::graph_merge::{self, CodeGraph, MergeReport};
use spanlens_enrich::pipeline::{self, BatchReport, EnrichmentBackend};
use spanlens_enrich::plan::{self, PlanItem};
use spanlens_indexer::embed_writer::{EmbedReport, EmbeddingWriter};
use spanlens_indexer::ingest::{self, ExtractedFile, IndexReport};
use spanlens_indexer::scanner;
use spanlens_query::freshness::{self, FreshnessReport};
use spanlens_query::hybrid;
use spanlens_query::rerank::RankedHit;
use spanlens_state::embedding::EmbeddingProvider;
use spanlens_state::ignore_rules::IgnoreRules;
use spanlens_state::ledger::{self, RepairReport};
use spanlens_state::locks::{FileLockService, HeldLock, LockService, TaskIdentity};
use spanlens_state::{db, schema};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Search results together with the freshness verdict they were served under.
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub freshness: FreshnessReport,
    pub hits: Vec<RankedHit>,
    /// Result files modified after the last index run.
    pub modified_paths: Vec<String>,
}

/// Everything one process needs to work on a repo: configuration, the open
/// store, the embedding model and the lock service.
///
/// Built once at startup and passed to callers; dropping it closes the
/// store. [`Context::close`] does the same but reports errors.
pub struct Context {
    config: Config,
    repo_root: PathBuf,
    conn: Connection,
    resolved: ResolvedEmbedding,
    embedder: EmbeddingWriter,
    locks: Box<dyn LockService>,
    ignore: IgnoreRules,
    task: TaskIdentity,
    cancel: Arc<AtomicBool>,
}

impl Context {
    /// Open (creating if needed) the store for `repo_root`.
    pub fn open(repo_root: &Path, config: Config) -> Result<Self, StateError> {
        let repo_root = repo_root.to_path_buf();
        let db_path = config.index_db_path(&repo_root);
        let conn = db::open_connection_with_config(
            &db_path,
            config.storage.busy_timeout_ms,
            config.storage.cache_size,
        )?;
        schema::create_tables(&conn)?;

        let resolved = config.embedding.resolved();
        let embedder = EmbeddingWriter::new(&resolved)?;
        let locks: Box<dyn LockService> = Box::new(FileLockService::new(
            config.lock_dir(&repo_root),
            Duration::from_millis(config.locks.backoff_ms),
        ));
        let ignore = IgnoreRules::load(&repo_root)?;
        let started_at = spanlens_core::time::now_epoch_secs();
        let task = TaskIdentity::new(
            format!("{}-{}", std::process::id(), (started_at * 1_000_000.0) as u64),
            started_at,
        );
        info!(
            repo = %repo_root.display(),
            task_id = %task.task_id,
            model = %resolved.model,
            "context opened"
        );

        Ok(Self {
            config,
            repo_root,
            conn,
            resolved,
            embedder,
            locks,
            ignore,
            task,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_lock_service(mut self, locks: Box<dyn LockService>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_embedding_provider(mut self, provider: Box<dyn EmbeddingProvider + Send>) -> Self {
        self.embedder = EmbeddingWriter::with_provider(provider, &self.resolved);
        self
    }

    /// Rename the task; its wound-wait priority stays as opened.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task.task_id = task_id.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn locks(&self) -> &dyn LockService {
        self.locks.as_ref()
    }

    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    /// When this task started, fixed for the life of the context. Every lock
    /// request presents it, so retries keep their wound-wait priority.
    pub fn started_at(&self) -> f64 {
        self.task.started_at
    }

    /// Flag polled by long-running batches; set it (e.g. from a signal
    /// handler) to stop at the next unit boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.config.ledger_path(&self.repo_root)
    }

    pub fn index(&self, files: &[ExtractedFile]) -> Result<IndexReport, StateError> {
        ingest::index_files(
            &self.conn,
            &self.repo_root,
            &self.config,
            files,
            self.locks.as_ref(),
            &self.task,
            &self.cancel,
        )
    }

    /// Scan the repo and index every file as a single span.
    pub fn index_repo(&self) -> Result<IndexReport, StateError> {
        let scanned = scanner::scan_directory(&self.repo_root, self.config.index.max_file_size);
        let files: Vec<ExtractedFile> = scanned
            .iter()
            .filter_map(scanner::whole_file_extraction)
            .collect();
        debug!(scanned = scanned.len(), extracted = files.len(), "repo scanned");
        self.index(&files)
    }

    fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.config.locks.ttl_secs.max(1))
    }

    /// Embed pending spans while holding the repo's index lock.
    pub fn embed_pending(&mut self, limit: usize) -> Result<EmbedReport, StateError> {
        let resource = ingest::index_resource(&self.repo_root);
        let mut lease =
            HeldLock::acquire_for(self.locks.as_ref(), &resource, &self.task, self.lease_ttl())?;
        let report =
            self.embedder
                .embed_pending(&self.conn, &self.ignore, limit, &mut lease, &self.cancel)?;
        release_lease(lease);
        Ok(report)
    }

    pub fn freshness(&self) -> FreshnessReport {
        freshness::check_freshness(&self.config.index_status_path(&self.repo_root), &self.repo_root)
    }

    /// Hybrid search, reported alongside the freshness gate's verdict.
    pub fn search(&mut self, query: &str) -> Result<SearchResponse, StateError> {
        let freshness = self.freshness();
        let hits = hybrid::hybrid_search(
            &self.conn,
            self.embedder.provider_mut(),
            &self.resolved,
            &self.config.rerank,
            query,
        )?;

        let mut modified_paths: Vec<String> = Vec::new();
        for hit in &hits {
            let path = &hit.record.span.file_path;
            if modified_paths.contains(path) {
                continue;
            }
            let guard = freshness::check_file_freshness(
                &self.repo_root.join(path),
                freshness.last_indexed_at.as_deref(),
            );
            if !guard.is_safe() {
                modified_paths.push(path.clone());
            }
        }
        Ok(SearchResponse {
            freshness,
            hits,
            modified_paths,
        })
    }

    pub fn plan(&self, limit: usize) -> Result<Vec<PlanItem>, StateError> {
        plan::build_plan(
            &self.conn,
            &self.repo_root,
            &self.ignore,
            limit,
            Duration::from_secs(self.config.enrichment.cooldown_secs),
            self.config.enrichment.schema_version,
        )
    }

    fn enrich_resource(&self) -> String {
        format!(
            "{}{}",
            constants::ENRICH_RESOURCE_PREFIX,
            self.repo_root.display()
        )
    }

    /// Plan and enrich up to `limit` spans through `backend`. Concurrent
    /// enrichment runs on the same repo are refused with `ResourceBusy`.
    pub fn enrich(
        &self,
        backend: &mut dyn EnrichmentBackend,
        limit: usize,
    ) -> Result<BatchReport, StateError> {
        let resource = self.enrich_resource();
        let mut lease =
            HeldLock::acquire_for(self.locks.as_ref(), &resource, &self.task, self.lease_ttl())?;
        let items = self.plan(limit)?;
        let report = self.run_enrichment(backend, &items, &mut lease)?;
        release_lease(lease);
        Ok(report)
    }

    /// Enrich an already built plan under the repo's enrichment lock,
    /// recording every attempt in the ledger.
    pub fn enrich_items(
        &self,
        backend: &mut dyn EnrichmentBackend,
        items: &[PlanItem],
    ) -> Result<BatchReport, StateError> {
        let resource = self.enrich_resource();
        let mut lease =
            HeldLock::acquire_for(self.locks.as_ref(), &resource, &self.task, self.lease_ttl())?;
        let report = self.run_enrichment(backend, items, &mut lease)?;
        release_lease(lease);
        Ok(report)
    }

    fn run_enrichment(
        &self,
        backend: &mut dyn EnrichmentBackend,
        items: &[PlanItem],
        lease: &mut HeldLock<'_>,
    ) -> Result<BatchReport, StateError> {
        pipeline::run_batch(
            &self.conn,
            items,
            backend,
            &self.ledger_path(),
            &self.config.enrichment,
            lease,
            &self.cancel,
        )
    }

    pub fn repair_ledger(&self) -> Result<RepairReport, StateError> {
        ledger::repair_ledger(&self.ledger_path())
    }

    pub fn merge_graph(&self, graph: &mut CodeGraph) -> Result<MergeReport, StateError> {
        graph_merge::merge(graph, &self.repo_root, &self.config)
    }

    pub fn close(self) -> Result<(), StateError> {
        self.conn.close().map_err(|(_, e)| StateError::sqlite(e))?;
        debug!("context closed");
        Ok(())
    }
}

/// The work is already committed; a failed release only leaves the lock to
/// expire on its TTL.
fn release_lease(lease: HeldLock<'_>) {
    let resource = lease.resource().to_string();
    if let Err(err) = lease.release() {
        warn!(%resource, error = %err, "failed to release lock");
    }
}
