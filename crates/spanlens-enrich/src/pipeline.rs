use crate::plan::PlanItem;
use crate::validate::{self, ValidatedEnrichment};
use rusqlite::Connection;
use spanlens_core::config::EnrichmentConfig;
use spanlens_core::error::{EnrichError, StateError};
use spanlens_state::enrichments::{self, EnrichmentRecord};
use spanlens_state::ledger::{self, EnrichmentEvent};
use spanlens_state::locks::HeldLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Store a validated enrichment for `span_hash` in one transaction.
pub fn commit(
    conn: &Connection,
    span_hash: &str,
    validated: &ValidatedEnrichment,
    model: &str,
    schema_version: u32,
) -> Result<EnrichmentRecord, StateError> {
    let payload = &validated.payload;
    let record = EnrichmentRecord {
        span_hash: span_hash.to_string(),
        summary: payload.summary.trim().to_string(),
        inputs: payload.inputs.clone(),
        outputs: payload.outputs.clone(),
        side_effects: payload.side_effects.clone(),
        pitfalls: payload.pitfalls.clone(),
        usage_snippet: payload.usage_snippet.clone(),
        evidence: validated.evidence.clone(),
        model: model.to_string(),
        schema_version,
        tags: payload.tags.clone(),
    };
    enrichments::store_enrichment(conn, &record)?;
    Ok(record)
}

/// Raw reply from an enrichment backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    pub text: String,
    pub model: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// Adapter over whatever produces enrichment JSON for a plan item
/// (an LLM client, a subprocess wrapper, a canned fixture).
pub trait EnrichmentBackend {
    /// Model identifier recorded when the backend fails before answering.
    fn model_id(&self) -> &str;
    fn enrich(&mut self, item: &PlanItem) -> Result<BackendResponse, EnrichError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// `(span_hash, message)` for every skipped item.
    pub failures: Vec<(String, String)>,
    pub interrupted: bool,
    /// Ledger appends that failed; the enrichment outcome still stands.
    pub ledger_failures: usize,
}

/// Enrich every plan item in order: call the backend, validate, commit, and
/// record the attempt in the ledger.
///
/// Per-item problems (backend error, invalid response, span gone) are
/// collected in the report and processing continues. Store errors other
/// than a vanished span abort the batch after being recorded. The lease is
/// renewed before each item; a wounded or lapsed holder stops there.
pub fn run_batch(
    conn: &Connection,
    plan: &[PlanItem],
    backend: &mut dyn EnrichmentBackend,
    ledger_path: &Path,
    config: &EnrichmentConfig,
    lease: &mut HeldLock<'_>,
    cancel: &AtomicBool,
) -> Result<BatchReport, StateError> {
    let mut report = BatchReport::default();

    for item in plan {
        if cancel.load(Ordering::Relaxed) {
            info!(remaining = plan.len() - report.succeeded - report.failed, "enrichment batch cancelled");
            report.interrupted = true;
            break;
        }
        if !lease.renew()? {
            report.interrupted = true;
            break;
        }

        let started = Instant::now();
        let outcome = attempt(conn, item, backend, config.schema_version);
        let duration_ms = started.elapsed().as_millis() as u64;

        let (event, fatal) = match outcome {
            Ok((record, response)) => {
                debug!(span_hash = %record.span_hash, duration_ms, "span enriched");
                report.succeeded += 1;
                let event = EnrichmentEvent::success(&item.span_hash, &response.model, duration_ms)
                    .with_tokens(response.prompt_tokens, response.completion_tokens);
                (event, None)
            }
            Err(failure) => {
                let message = failure.message();
                warn!(span_hash = %item.span_hash, error = %message, "enrichment failed");
                report.failed += 1;
                report.failures.push((item.span_hash.clone(), message.clone()));
                let model = failure.model().unwrap_or(backend.model_id()).to_string();
                let event = EnrichmentEvent::failure(
                    &item.span_hash,
                    model,
                    duration_ms,
                    &message,
                    config.max_error_chars,
                )
                .with_tokens(failure.prompt_tokens(), failure.completion_tokens());
                (event, failure.into_fatal())
            }
        };

        if let Err(err) = ledger::append_event(ledger_path, &event) {
            warn!(span_hash = %item.span_hash, error = %err, "ledger append failed");
            report.ledger_failures += 1;
        }
        if let Some(err) = fatal {
            return Err(err);
        }
    }

    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        interrupted = report.interrupted,
        "enrichment batch finished"
    );
    Ok(report)
}

enum Failure {
    Backend(EnrichError),
    Invalid(validate::ValidationErrors, BackendResponse),
    Store(StateError, BackendResponse),
}

impl Failure {
    fn message(&self) -> String {
        match self {
            Self::Backend(err) => err.to_string(),
            Self::Invalid(errors, _) => format!("validation failed: {errors}"),
            Self::Store(err, _) => err.to_string(),
        }
    }

    fn response(&self) -> Option<&BackendResponse> {
        match self {
            Self::Backend(_) => None,
            Self::Invalid(_, response) | Self::Store(_, response) => Some(response),
        }
    }

    fn model(&self) -> Option<&str> {
        self.response().map(|r| r.model.as_str())
    }

    fn prompt_tokens(&self) -> Option<u64> {
        self.response().and_then(|r| r.prompt_tokens)
    }

    fn completion_tokens(&self) -> Option<u64> {
        self.response().and_then(|r| r.completion_tokens)
    }

    /// Store errors abort the batch, except a span removed by a concurrent
    /// reindex.
    fn into_fatal(self) -> Option<StateError> {
        match self {
            Self::Store(StateError::SpanNotFound { .. }, _) => None,
            Self::Store(err, _) => Some(err),
            Self::Backend(EnrichError::State(err)) => Some(err),
            _ => None,
        }
    }
}

fn attempt(
    conn: &Connection,
    item: &PlanItem,
    backend: &mut dyn EnrichmentBackend,
    schema_version: u32,
) -> Result<(EnrichmentRecord, BackendResponse), Failure> {
    let response = backend.enrich(item).map_err(Failure::Backend)?;
    let validated = match validate::validate(&response.text, item.lines[0], item.lines[1]) {
        Ok(validated) => validated,
        Err(errors) => return Err(Failure::Invalid(errors, response)),
    };
    match commit(conn, &item.span_hash, &validated, &response.model, schema_version) {
        Ok(record) => Ok((record, response)),
        Err(err) => Err(Failure::Store(err, response)),
    }
}
