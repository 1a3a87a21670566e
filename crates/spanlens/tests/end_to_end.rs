use serde_json::json;
use spanlens::Context;
use spanlens_core::config::Config;
use spanlens_core::error::{EnrichError, LockError, StateError};
use spanlens_core::types::{FreshnessState, IndexState};
use spanlens_enrich::graph_merge::{CodeGraph, GraphEntity};
use spanlens_enrich::pipeline::{BackendResponse, EnrichmentBackend};
use spanlens_enrich::plan::PlanItem;
use spanlens_state::enrichments;
use spanlens_state::ledger;
use spanlens_state::locks::{
    AcquireOutcome, FileLockService, LockRecord, LockService, ReleaseOutcome,
};
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

const CONFIG_PY: &str = "def load_config(path):\n    with open(path) as fh:\n        return parse_toml(fh.read())\n";
const RENDER_PY: &str = "def render_widget(color):\n    draw_pixels(color)\n";
const NOTES_MD: &str = "# Notes\n\nConfiguration is loaded from a toml file.\n";

/// Answers well-formed JSON for `config.py` and garbage for everything else.
struct FixtureBackend;

impl EnrichmentBackend for FixtureBackend {
    fn model_id(&self) -> &str {
        "fixture"
    }

    fn enrich(&mut self, item: &PlanItem) -> Result<BackendResponse, EnrichError> {
        let text = if item.path.ends_with("config.py") {
            json!({
                "summary": "Loads and parses a TOML config file.",
                "inputs": ["path"],
                "outputs": ["parsed config"],
                "side_effects": ["opens a file"],
                "pitfalls": ["raises if the file is missing"],
                "usage_snippet": "cfg = load_config('app.toml')",
                "evidence": [
                    {"field": "summary", "lines": [1, 3]},
                    {"field": "side_effects", "lines": [2, 2]}
                ],
                "tags": ["config", "io"]
            })
            .to_string()
        } else {
            "{\"summary\": \"truncated".to_string()
        };
        Ok(BackendResponse {
            text,
            model: "fixture-v1".to_string(),
            prompt_tokens: Some(120),
            completion_tokens: Some(60),
        })
    }
}

fn write_repo(root: &Path) {
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::create_dir_all(root.join("docs")).unwrap();
    std::fs::write(root.join("src/config.py"), CONFIG_PY).unwrap();
    std::fs::write(root.join("src/render.py"), RENDER_PY).unwrap();
    std::fs::write(root.join("docs/notes.md"), NOTES_MD).unwrap();
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.enrichment.cooldown_secs = 0;
    config
}

fn commit_all(repo: &git2::Repository, message: &str) -> String {
    let mut index = repo.index().unwrap();
    index
        .add_all(["src", "docs"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = git2::Signature::now("t", "t@example.com").unwrap();
    let parents: Vec<git2::Commit<'_>> = repo
        .head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok())
        .into_iter()
        .collect();
    let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
        .to_string()
}

#[test]
fn index_enrich_and_repair_round_trip() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let ctx = Context::open(dir.path(), test_config()).unwrap();

    let report = ctx.index_repo().unwrap();
    assert_eq!(report.files_indexed, 3);
    assert_eq!(report.final_state, IndexState::Fresh);
    assert_eq!(enrichments::count_enrichments(ctx.conn()).unwrap(), 0);

    let plan: Vec<PlanItem> = ctx
        .plan(10)
        .unwrap()
        .into_iter()
        .filter(|item| item.path.ends_with(".py"))
        .collect();
    assert_eq!(plan.len(), 2);

    let batch = ctx.enrich_items(&mut FixtureBackend, &plan).unwrap();
    assert_eq!(batch.succeeded, 1);
    assert_eq!(batch.failed, 1);
    assert_eq!(batch.ledger_failures, 0);

    let events = ledger::read_events(&ctx.ledger_path()).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events.iter().filter(|e| e.success).count(), 1);
    assert_eq!(events.iter().filter(|e| !e.success).count(), 1);
    let failure = events.iter().find(|e| !e.success).unwrap();
    assert!(failure.error.as_deref().unwrap().contains("validation failed"));

    assert_eq!(enrichments::count_enrichments(ctx.conn()).unwrap(), 1);
    let enriched = plan.iter().find(|item| item.path == "src/config.py").unwrap();
    let stored = enrichments::get_enrichment(ctx.conn(), &enriched.span_hash)
        .unwrap()
        .unwrap();
    assert_eq!(stored.evidence.len(), 2);
    assert_eq!(stored.tags, vec!["config", "io"]);

    let repair = ctx.repair_ledger().unwrap();
    assert_eq!(repair.valid, 2);
    assert_eq!(repair.discarded, 0);
    assert!(repair.backup.is_none());

    // Enriched spans drop out of the next plan.
    let remaining = ctx.plan(10).unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|item| item.path != "src/config.py"));

    ctx.close().unwrap();
}

#[test]
fn search_is_served_with_a_freshness_verdict() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let repo = git2::Repository::init(dir.path()).unwrap();
    commit_all(&repo, "initial");

    let mut ctx = Context::open(dir.path(), test_config()).unwrap();
    ctx.index_repo().unwrap();
    let embedded = ctx.embed_pending(100).unwrap();
    assert_eq!(embedded.embedded, 3);

    let response = ctx.search("load toml config").unwrap();
    assert_eq!(response.freshness.state, FreshnessState::Fresh);
    assert!(response.freshness.use_index);
    assert!(!response.hits.is_empty());
    assert_eq!(response.hits[0].record.span.file_path, "src/config.py");
    assert!(response.modified_paths.is_empty());

    std::fs::write(dir.path().join("src/config.py"), "def load_config():\n    return {}\n").unwrap();
    commit_all(&repo, "rewrite config");
    let response = ctx.search("load toml config").unwrap();
    assert_eq!(response.freshness.state, FreshnessState::Stale);
    assert!(!response.freshness.use_index);
}

#[test]
fn search_outside_git_is_not_trusted() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let mut ctx = Context::open(dir.path(), test_config()).unwrap();
    ctx.index_repo().unwrap();
    let response = ctx.search("render widget").unwrap();
    assert_eq!(response.freshness.state, FreshnessState::Unknown);
    assert!(!response.freshness.use_index);
}

#[test]
fn graph_entities_pick_up_stored_enrichment() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let ctx = Context::open(dir.path(), test_config()).unwrap();
    ctx.index_repo().unwrap();
    let plan = ctx.plan(10).unwrap();
    ctx.enrich_items(&mut FixtureBackend, &plan).unwrap();

    let mut graph = CodeGraph {
        entities: vec![
            GraphEntity {
                id: "load_config".to_string(),
                kind: "function".to_string(),
                path: Some("src/config.py".to_string()),
                start_line: Some(1),
                end_line: Some(3),
                ..GraphEntity::default()
            },
            GraphEntity {
                id: "render_widget".to_string(),
                kind: "function".to_string(),
                path: Some("src/render.py".to_string()),
                start_line: Some(1),
                end_line: Some(2),
                ..GraphEntity::default()
            },
        ],
    };
    let report = ctx.merge_graph(&mut graph).unwrap();
    assert!(report.performed);
    assert_eq!(report.enriched, 1);
    let metadata = &graph.entities[0].metadata;
    assert_eq!(metadata["summary"], json!("Loads and parses a TOML config file."));
    assert_eq!(metadata["enrichment_strategy"], json!("span_hash_text"));
    assert!(graph.entities[1].metadata.is_empty());
}

#[test]
fn concurrent_writer_is_refused_while_index_lock_is_held() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let ctx = Context::open(dir.path(), test_config()).unwrap().with_task_id("indexer-b");

    let resource = spanlens_indexer::ingest::index_resource(dir.path());
    let outcome = ctx
        .locks()
        .acquire(&resource, "indexer-a", Duration::from_secs(60), 1.0)
        .unwrap();
    assert!(matches!(outcome, AcquireOutcome::Granted(_)));

    let err = ctx.index_repo().unwrap_err();
    assert!(matches!(err, StateError::ResourceBusy { .. }));
    // The younger task waited; the holder was not wounded.
    assert!(!ctx.locks().is_wounded(&resource, "indexer-a").unwrap());
}

#[test]
fn earlier_context_wounds_a_later_lock_holder() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let elder = Context::open(dir.path(), test_config()).unwrap().with_task_id("elder");
    std::thread::sleep(Duration::from_millis(5));
    let younger = Context::open(dir.path(), test_config()).unwrap().with_task_id("younger");
    assert!(elder.started_at() < younger.started_at());

    let resource = spanlens_indexer::ingest::index_resource(dir.path());
    younger
        .locks()
        .acquire(&resource, younger.task_id(), Duration::from_secs(60), younger.started_at())
        .unwrap();

    // The retry happens after the younger task started, but still outranks it.
    std::thread::sleep(Duration::from_millis(5));
    let err = elder.index_repo().unwrap_err();
    assert!(matches!(err, StateError::ResourceBusy { .. }));
    assert!(younger.locks().is_wounded(&resource, "younger").unwrap());

    assert_eq!(
        younger.locks().release(&resource, "younger").unwrap(),
        ReleaseOutcome::Released
    );
    let report = elder.index_repo().unwrap();
    assert_eq!(report.final_state, IndexState::Fresh);
}

/// File-backed locks whose release always fails.
struct StuckRelease(FileLockService);

impl LockService for StuckRelease {
    fn acquire(
        &self,
        resource: &str,
        task_id: &str,
        ttl: Duration,
        started_at: f64,
    ) -> Result<AcquireOutcome, LockError> {
        self.0.acquire(resource, task_id, ttl, started_at)
    }

    fn release(&self, _resource: &str, _task_id: &str) -> Result<ReleaseOutcome, LockError> {
        Err(LockError::io(
            "locks",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only lock dir"),
        ))
    }

    fn current(&self, resource: &str) -> Result<Option<LockRecord>, LockError> {
        self.0.current(resource)
    }
}

#[test]
fn failed_lock_release_keeps_the_committed_result() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let config = test_config();
    let locks = FileLockService::new(config.lock_dir(dir.path()), Duration::from_millis(10));
    let mut ctx = Context::open(dir.path(), config)
        .unwrap()
        .with_lock_service(Box::new(StuckRelease(locks)));

    ctx.index_repo().unwrap();
    let embedded = ctx.embed_pending(100).unwrap();
    assert_eq!(embedded.embedded, 3);
    assert!(!embedded.interrupted);

    let plan: Vec<PlanItem> = ctx
        .plan(10)
        .unwrap()
        .into_iter()
        .filter(|item| item.path == "src/config.py")
        .collect();
    let batch = ctx.enrich_items(&mut FixtureBackend, &plan).unwrap();
    assert_eq!(batch.succeeded, 1);
    assert_eq!(enrichments::count_enrichments(ctx.conn()).unwrap(), 1);
}

#[test]
fn wounded_enrichment_run_stops_early() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let ctx = Context::open(dir.path(), test_config()).unwrap().with_task_id("runner");
    ctx.index_repo().unwrap();
    let plan = ctx.plan(10).unwrap();
    assert_eq!(plan.len(), 3);

    let resource = format!("enrich:{}", dir.path().display());
    let mut backend = ElderTakesOver {
        locks: FileLockService::new(
            test_config().lock_dir(dir.path()),
            Duration::from_millis(10),
        ),
        resource,
        calls: 0,
    };
    let batch = ctx.enrich_items(&mut backend, &plan).unwrap();
    assert!(batch.interrupted);
    assert_eq!(backend.calls, 1);
    assert_eq!(ledger::read_events(&ctx.ledger_path()).unwrap().len(), 1);
}

/// Delegates to the fixture, but an older runner claims the enrichment lock
/// during the first call.
struct ElderTakesOver {
    locks: FileLockService,
    resource: String,
    calls: usize,
}

impl EnrichmentBackend for ElderTakesOver {
    fn model_id(&self) -> &str {
        "fixture"
    }

    fn enrich(&mut self, item: &PlanItem) -> Result<BackendResponse, EnrichError> {
        self.calls += 1;
        if self.calls == 1 {
            let outcome = self
                .locks
                .acquire(&self.resource, "elder", Duration::from_secs(60), 1.0)
                .unwrap();
            assert!(matches!(outcome, AcquireOutcome::Wounded { .. }));
        }
        FixtureBackend.enrich(item)
    }
}
