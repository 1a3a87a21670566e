use rusqlite::Connection;
use spanlens_core::config::ResolvedEmbedding;
use spanlens_core::error::StateError;
use spanlens_state::embedding::{self, EmbeddingProvider};
use spanlens_state::embeddings::{self, EmbeddingRecord};
use spanlens_state::ignore_rules::IgnoreRules;
use spanlens_state::locks::HeldLock;
use spanlens_state::spans;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub embedded: usize,
    pub batches: usize,
    pub interrupted: bool,
}

/// Embeds spans that have no vector for the active model yet.
pub struct EmbeddingWriter {
    provider: Box<dyn EmbeddingProvider + Send>,
    passage_prefix: String,
    normalize: bool,
    batch_size: usize,
}

impl EmbeddingWriter {
    pub fn new(resolved: &ResolvedEmbedding) -> Result<Self, StateError> {
        let provider = embedding::build_embedding_provider(resolved)?;
        Ok(Self::with_provider(provider, resolved))
    }

    pub fn with_provider(
        provider: Box<dyn EmbeddingProvider + Send>,
        resolved: &ResolvedEmbedding,
    ) -> Self {
        Self {
            provider,
            passage_prefix: resolved.passage_prefix.clone(),
            normalize: resolved.normalize,
            batch_size: resolved.batch_size.max(1),
        }
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    /// The provider, for embedding queries with the same model.
    pub fn provider_mut(&mut self) -> &mut dyn EmbeddingProvider {
        self.provider.as_mut()
    }

    /// Embed up to `limit` pending spans, committing one batch at a time.
    ///
    /// A failed batch rolls back on its own; earlier batches stay stored.
    /// The lease is renewed before every batch and the pass stops once it
    /// reports the holder wounded or lapsed.
    pub fn embed_pending(
        &mut self,
        conn: &Connection,
        ignore: &IgnoreRules,
        limit: usize,
        lease: &mut HeldLock<'_>,
        cancel: &AtomicBool,
    ) -> Result<EmbedReport, StateError> {
        let model = self.provider.model_id().to_string();
        let dimensions = self.provider.dimensions();
        let pending = spans::get_pending_for_embedding(conn, &model, limit, ignore)?;
        let mut report = EmbedReport::default();

        for chunk in pending.chunks(self.batch_size) {
            if cancel.load(Ordering::SeqCst) {
                report.interrupted = true;
                break;
            }
            if !lease.renew()? {
                report.interrupted = true;
                break;
            }
            let inputs: Vec<String> = chunk
                .iter()
                .map(|record| format!("{}{}", self.passage_prefix, record.text))
                .collect();
            let vectors = self.provider.embed_batch(&inputs)?;
            if vectors.len() != chunk.len() {
                return Err(StateError::embedding(format!(
                    "embedding output size mismatch: expected={} got={}",
                    chunk.len(),
                    vectors.len()
                )));
            }

            let mut records = Vec::with_capacity(chunk.len());
            for (record, mut vector) in chunk.iter().zip(vectors) {
                if vector.len() != dimensions {
                    return Err(StateError::DimensionMismatch {
                        expected: dimensions,
                        actual: vector.len(),
                    });
                }
                if self.normalize {
                    embedding::l2_normalize(&mut vector);
                }
                records.push(EmbeddingRecord {
                    span_hash: record.span.span_hash.clone(),
                    model: model.clone(),
                    vector,
                    normalized: self.normalize,
                });
            }
            embeddings::store_embeddings(conn, &records)?;
            report.embedded += records.len();
            report.batches += 1;
            debug!(batch = report.batches, size = records.len(), "embedding batch stored");
        }

        info!(
            model = %model,
            embedded = report.embedded,
            batches = report.batches,
            interrupted = report.interrupted,
            "embedding pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanlens_core::config::Config;
    use spanlens_core::types::Span;
    use spanlens_state::files::{self, FileRecord};
    use spanlens_state::locks::{FileLockService, LockService};
    use spanlens_state::{db, schema};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    const RESOURCE: &str = "index:/repo";

    fn locks_in(dir: &Path) -> FileLockService {
        FileLockService::new(dir.join("locks"), Duration::from_millis(10))
    }

    fn hold_index(locks: &FileLockService) -> HeldLock<'_> {
        HeldLock::acquire(locks, RESOURCE, "embedder", Duration::from_secs(60), 50.0).unwrap()
    }

    fn setup_conn(span_count: usize) -> (tempfile::TempDir, Connection) {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("embed.db")).unwrap();
        schema::create_tables(&conn).unwrap();
        for path in ["src/a.rs", "vendor/b.rs"] {
            files::upsert_file(
                &conn,
                &FileRecord {
                    path: path.to_string(),
                    language: "rust".to_string(),
                    content_hash: "h".to_string(),
                    size_bytes: 1,
                    mtime_ns: None,
                    indexed_at: "2026-01-01T00:00:00Z".to_string(),
                },
            )
            .unwrap();
        }
        for i in 0..span_count {
            let path = if i == 0 { "vendor/b.rs" } else { "src/a.rs" };
            spans::put_span(
                &conn,
                &Span {
                    file_path: path.to_string(),
                    language: "rust".to_string(),
                    symbol: format!("f{i}"),
                    kind: "function".to_string(),
                    start_line: i as u32 + 1,
                    end_line: i as u32 + 1,
                    span_hash: format!("span-{i}"),
                },
                &format!("fn f{i}() {{ load_config() }}"),
            )
            .unwrap();
        }
        (dir, conn)
    }

    struct WrongSize;

    impl EmbeddingProvider for WrongSize {
        fn model_id(&self) -> &str {
            "wrong"
        }
        fn model_version(&self) -> &str {
            "1"
        }
        fn dimensions(&self) -> usize {
            4
        }
        fn embed_batch(&mut self, inputs: &[String]) -> Result<Vec<Vec<f32>>, StateError> {
            Ok(inputs.iter().map(|_| vec![1.0; 3]).collect())
        }
    }

    /// Embeds normally, but an older task claims the index lock while the
    /// first batch is in flight.
    struct ElderArrives {
        locks: FileLockService,
        calls: usize,
    }

    impl EmbeddingProvider for ElderArrives {
        fn model_id(&self) -> &str {
            "elder-arrives"
        }
        fn model_version(&self) -> &str {
            "1"
        }
        fn dimensions(&self) -> usize {
            4
        }
        fn embed_batch(&mut self, inputs: &[String]) -> Result<Vec<Vec<f32>>, StateError> {
            self.calls += 1;
            if self.calls == 1 {
                self.locks
                    .acquire(RESOURCE, "elder", Duration::from_secs(60), 1.0)
                    .unwrap();
            }
            Ok(inputs.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    fn resolved(batch_size: usize) -> ResolvedEmbedding {
        let mut config = Config::default();
        config.embedding.dimensions = 16;
        config.embedding.batch_size = batch_size;
        config.embedding.resolved()
    }

    #[test]
    fn embeds_pending_in_batches_and_skips_ignored() {
        let (dir, conn) = setup_conn(6);
        let ignore = IgnoreRules::from_patterns(dir.path(), &["vendor/"]).unwrap();
        let mut writer = EmbeddingWriter::new(&resolved(2)).unwrap();
        let locks = locks_in(dir.path());
        let mut lease = hold_index(&locks);

        let report = writer
            .embed_pending(&conn, &ignore, 100, &mut lease, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(report.embedded, 5);
        assert_eq!(report.batches, 3);

        let stored = embeddings::get_embedding(&conn, "span-1", writer.model_id())
            .unwrap()
            .unwrap();
        assert_eq!(stored.dim(), 16);
        assert!(stored.normalized);
        let norm: f32 = stored.vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        let again = writer
            .embed_pending(&conn, &ignore, 100, &mut lease, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(again.embedded, 0);
    }

    #[test]
    fn dimension_mismatch_rolls_back_the_batch() {
        let (dir, conn) = setup_conn(3);
        let ignore = IgnoreRules::empty();
        let locks = locks_in(dir.path());
        let mut lease = hold_index(&locks);
        let mut writer = EmbeddingWriter::with_provider(Box::new(WrongSize), &resolved(8));
        let err = writer
            .embed_pending(&conn, &ignore, 10, &mut lease, &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(embeddings::count_embeddings(&conn, "wrong").unwrap(), 0);
    }

    #[test]
    fn cancellation_stops_before_the_next_batch() {
        let (dir, conn) = setup_conn(4);
        let locks = locks_in(dir.path());
        let mut lease = hold_index(&locks);
        let mut writer = EmbeddingWriter::new(&resolved(1)).unwrap();
        let report = writer
            .embed_pending(&conn, &IgnoreRules::empty(), 10, &mut lease, &AtomicBool::new(true))
            .unwrap();
        assert!(report.interrupted);
        assert_eq!(report.embedded, 0);
    }

    #[test]
    fn wounded_holder_stops_before_the_next_batch() {
        let (dir, conn) = setup_conn(4);
        let locks = locks_in(dir.path());
        let mut lease = hold_index(&locks);
        let provider = ElderArrives {
            locks: locks_in(dir.path()),
            calls: 0,
        };
        let mut writer = EmbeddingWriter::with_provider(Box::new(provider), &resolved(1));

        let report = writer
            .embed_pending(&conn, &IgnoreRules::empty(), 10, &mut lease, &AtomicBool::new(false))
            .unwrap();
        assert!(report.interrupted);
        assert_eq!(report.batches, 1);
        assert_eq!(embeddings::count_embeddings(&conn, "elder-arrives").unwrap(), 1);
        assert!(locks.is_wounded(RESOURCE, "embedder").unwrap());
    }
}
