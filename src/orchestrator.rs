//! Sequences Producer -> Enricher -> Merger -> Transformer -> Index Loader
//! in nested paged loops, and owns the global run state and watermark.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Settings;
use crate::enricher::Enricher;
use crate::error::EtlError;
use crate::index_loader::IndexWriter;
use crate::merger::Merger;
use crate::producer::Producer;
use crate::sql::SqlExecutor;
use crate::state::{CacheState, StateStore};
use crate::transform::transform;

fn epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("1970-01-01T00:00:00Z")
        .expect("epoch literal is valid RFC3339")
        .with_timezone(&Utc)
}

/// Folds `candidate` into the running watermark maximum. Mirrors the
/// reference `max_date` helper: an absent running maximum is simply
/// replaced, never compared against.
fn bump_max(running: &mut Option<DateTime<Utc>>, candidate: DateTime<Utc>) {
    *running = Some(match *running {
        Some(current) if current >= candidate => current,
        _ => candidate,
    });
}

/// Owns the main state store and drives one full incremental run per
/// `run_once()` call. Stage-level state stores (Producer/Enricher/Merger)
/// are fresh per stage instance, addressed by their configured cache paths.
pub struct Orchestrator<'a> {
    sql: &'a SqlExecutor,
    index: &'a dyn IndexWriter,
    main_store: StateStore,
    producer_store: StateStore,
    enricher_store: StateStore,
    merger_store: StateStore,
    schema: String,
    limit: u32,
}

impl<'a> Orchestrator<'a> {
    pub fn new(sql: &'a SqlExecutor, index: &'a dyn IndexWriter, settings: &Settings) -> Self {
        Self {
            sql,
            index,
            main_store: StateStore::new(settings.cache.main.as_str()),
            producer_store: StateStore::new(settings.cache.producer.as_str()),
            enricher_store: StateStore::new(settings.cache.enricher.as_str()),
            merger_store: StateStore::new(settings.cache.merger.as_str()),
            schema: settings.db.schema.clone(),
            limit: settings.main.limit_size,
        }
    }

    /// Runs the full startup sequence and main loop once. Returns
    /// `Err(EtlError::Interlock)` without touching the catalog or index if a
    /// previous run never finished.
    pub async fn run_once(&self) -> Result<(), EtlError> {
        let global_state = self.main_store.get::<CacheState>("global_state")?;
        if global_state == Some(CacheState::Start) {
            tracing::warn!("a previous run is still marked START, refusing to start a new one");
            return Err(EtlError::Interlock);
        }

        let modified_after = self
            .main_store
            .get::<DateTime<Utc>>("modified_after")?
            .unwrap_or_else(epoch);

        let mut n_run: u32 = if global_state == Some(CacheState::Error) {
            self.main_store.get::<u32>("global_n_run")?.unwrap_or(1)
        } else {
            1
        };

        match self.run_main_loop(modified_after, &mut n_run).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.main_store.set("global_state", &CacheState::Error)?;
                self.main_store.set("global_n_run", &n_run)?;
                tracing::error!(run = n_run, error = %err, "run failed, marking global_state ERROR");
                Err(EtlError::from(err))
            }
        }
    }

    async fn run_main_loop(&self, modified_after: DateTime<Utc>, n_run: &mut u32) -> Result<()> {
        // Starts absent, like the reference `last_max_modified = None`. Only
        // ever set once a stage actually reports a modified timestamp, so an
        // empty-source run leaves `modified_after` untouched in the state
        // store rather than pinning it back to the watermark it started from.
        let mut last_max: Option<DateTime<Utc>> = None;

        loop {
            self.main_store.set("global_state", &CacheState::Start)?;
            self.main_store.set("global_n_run", n_run)?;
            tracing::info!(run = *n_run, "starting Producer page");

            let producer = Producer::new(self.sql, &self.producer_store, &self.schema, modified_after, self.limit, *n_run);
            let producer_result = producer.collect().await?;

            if !producer_result.has_results {
                self.main_store.set("global_state", &CacheState::Finish)?;
                if let Some(watermark) = last_max {
                    self.main_store.set("modified_after", &watermark)?;
                }
                tracing::info!(run = *n_run, watermark = ?last_max, "run finished, no more changes");
                return Ok(());
            }
            bump_max(&mut last_max, producer_result.max_modified_after);

            let producer_filmwork: Vec<uuid::Uuid> =
                producer_result.filmwork.iter().map(|c| c.id).collect();
            // Films that changed on their own row never appear in either
            // Enricher link list (those only surface films reached through a
            // changed person/genre), so this page must be folded into a
            // Merger call directly or it is never indexed at all. It is
            // folded into whichever Enricher page is processed first, then
            // cleared.
            let mut producer_filmwork_pending = !producer_filmwork.is_empty();

            let mut n2: u32 = 1;
            loop {
                tracing::info!(run = *n_run, page = n2, "starting Enricher page");
                let enricher = Enricher::new(
                    self.sql,
                    &self.enricher_store,
                    &self.schema,
                    &producer_result,
                    modified_after,
                    self.limit,
                    n2,
                );
                let enricher_result = enricher.collect().await?;
                bump_max(&mut last_max, enricher_result.max_modified_after);

                let producer_ids_for_this_page: &[uuid::Uuid] = if producer_filmwork_pending {
                    &producer_filmwork
                } else {
                    &[]
                };

                if !enricher_result.has_results && producer_ids_for_this_page.is_empty() {
                    break;
                }
                producer_filmwork_pending = false;

                let merger = Merger::new(
                    self.sql,
                    &self.merger_store,
                    &self.schema,
                    &enricher_result,
                    producer_ids_for_this_page,
                    modified_after,
                );
                let merger_result = merger.collect().await?;
                bump_max(&mut last_max, merger_result.max_modified_after);

                let docs = transform(&merger_result.rows);
                tracing::info!(run = *n_run, page = n2, documents = docs.len(), "writing index batch");
                self.index.bulk_index(&docs).await?;

                if !enricher_result.has_results {
                    break;
                }
                n2 += 1;
            }

            *n_run += 1;
        }
    }
}
