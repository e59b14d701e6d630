//! The checkpointing protocol shared by the Producer, Enricher and Merger.
//!
//! Each stage is an ordered list of named, independently-checkpointed
//! sub-queries. `StageCheckpoint` is the table-driven generalization of the
//! reference implementation's per-class `collect()`: instead of an abstract
//! base class with three subclasses, one `StageCheckpoint` is built per
//! stage instance and `.step(name, query)` is called once per sub-method, in
//! order. The three-keys-per-sub-method contract (`C`, `C.m`, `C.m.result`)
//! is identical either way.

use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::HasModified;
use crate::state::{CacheState, StateStore};

/// Drives one stage's `collect()` pass: detects whether the previous
/// invocation of this stage crashed mid-flight, and for each sub-method
/// either executes it live or replays its cached result, per §4.8.
pub struct StageCheckpoint<'a> {
    store: &'a StateStore,
    stage: &'static str,
    /// The previous invocation of this stage never reached `FINISH`.
    is_broken: bool,
    /// Within a broken stage, whether we've already found and re-executed
    /// the sub-method that was mid-flight when it crashed. Every sub-method
    /// from that point on is re-executed rather than replayed, since a
    /// sub-method after the crash point was never even started last time.
    found_broken: bool,
    pub has_results: bool,
    pub max_modified_after: DateTime<Utc>,
}

impl<'a> StageCheckpoint<'a> {
    /// Begins a `collect()` pass for `stage`, reading whether the prior
    /// pass crashed and marking this one `START`.
    pub fn begin(store: &'a StateStore, stage: &'static str, watermark: DateTime<Utc>) -> Result<Self> {
        let previous = store.get::<CacheState>(stage)?;
        let is_broken = matches!(previous, Some(CacheState::Start));
        store.set(stage, &CacheState::Start)?;
        Ok(Self {
            store,
            stage,
            is_broken,
            found_broken: false,
            has_results: false,
            max_modified_after: watermark,
        })
    }

    /// Runs (or replays) one named sub-method and folds its result into
    /// `has_results`/`max_modified_after`.
    pub async fn step<T, F, Fut>(&mut self, method: &'static str, query: F) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + HasModified + Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let state_key = format!("{}.{}", self.stage, method);
        let result_key = format!("{}.{}.result", self.stage, method);

        let must_execute_live = !self.is_broken || self.found_broken;
        let result = if must_execute_live {
            self.execute_and_persist(&state_key, &result_key, query).await?
        } else {
            match self.store.get::<CacheState>(&state_key)? {
                Some(CacheState::Start) => {
                    // This is the sub-method that was mid-flight when the
                    // previous pass crashed: re-run it, and treat every
                    // subsequent sub-method in this stage as needing a live
                    // run too.
                    self.found_broken = true;
                    self.execute_and_persist(&state_key, &result_key, query).await?
                }
                _ => match self.store.get::<Vec<T>>(&result_key)? {
                    Some(cached) => cached,
                    // No cached result even though the sub-method isn't the
                    // broken one: the stage never reached this sub-method
                    // last time either. Run it live and keep looking for the
                    // actual break point in later sub-methods.
                    None => {
                        self.found_broken = true;
                        self.execute_and_persist(&state_key, &result_key, query).await?
                    }
                },
            }
        };

        self.analyze(&result);
        Ok(result)
    }

    async fn execute_and_persist<T, F, Fut>(
        &self,
        state_key: &str,
        result_key: &str,
        query: F,
    ) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        self.store.set(state_key, &CacheState::Start)?;
        let result = query().await?;
        self.store.set(state_key, &CacheState::Finish)?;
        self.store.set(result_key, &result)?;
        Ok(result)
    }

    fn analyze<T: HasModified>(&mut self, result: &[T]) {
        if result.is_empty() {
            return;
        }
        self.has_results = true;
        if let Some(max) = result.iter().map(HasModified::modified).max() {
            if max > self.max_modified_after {
                self.max_modified_after = max;
            }
        }
    }

    /// Marks this stage's `collect()` pass complete.
    pub fn finish(self) -> Result<()> {
        self.store.set(self.stage, &CacheState::Finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChangedRef;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("1970-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn changed(at: &str) -> ChangedRef {
        ChangedRef {
            id: Uuid::new_v4(),
            modified: DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn fresh_stage_executes_every_step_once() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("s.json"));
        let calls = AtomicUsize::new(0);

        let mut checkpoint = StageCheckpoint::begin(&store, "Producer", epoch()).unwrap();
        let result = checkpoint
            .step("get_person", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![changed("2024-01-01T10:00:00Z")])
            })
            .await
            .unwrap();
        checkpoint.finish().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn cache_replay_skips_live_query_when_crash_precedes_final_finish() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("s.json"));

        {
            let mut checkpoint = StageCheckpoint::begin(&store, "Producer", epoch()).unwrap();
            checkpoint
                .step("get_person", || async { Ok(vec![changed("2024-01-01T10:00:00Z")]) })
                .await
                .unwrap();
            // Deliberately skip `checkpoint.finish()`: every sub-method reached
            // FINISH but the stage crashed before persisting its own overall
            // FINISH. `Producer` is left at `START` from `begin()`, exactly
            // the state a real crash there would leave on disk.
        }

        let calls = Cell::new(0);
        let mut checkpoint = StageCheckpoint::begin(&store, "Producer", epoch()).unwrap();
        let result = checkpoint
            .step::<ChangedRef, _, _>("get_person", || {
                calls.set(calls.get() + 1);
                async { panic!("should not execute a live query on cache replay") }
            })
            .await
            .unwrap();
        checkpoint.finish().unwrap();

        assert_eq!(calls.get(), 0);
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn crash_mid_flight_reexecutes_only_the_broken_step_forward() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("s.json"));

        // Simulate a crash: get_person finished, get_genre START but never FINISH.
        store.set("Producer", &CacheState::Start).unwrap();
        store.set("Producer.get_person", &CacheState::Finish).unwrap();
        store
            .set("Producer.get_person.result", &vec![changed("2024-01-01T09:00:00Z")])
            .unwrap();
        store.set("Producer.get_genre", &CacheState::Start).unwrap();

        let person_calls = AtomicUsize::new(0);
        let genre_calls = AtomicUsize::new(0);

        let mut checkpoint = StageCheckpoint::begin(&store, "Producer", epoch()).unwrap();
        checkpoint
            .step("get_person", || async {
                person_calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![changed("2024-01-01T09:00:00Z")])
            })
            .await
            .unwrap();
        checkpoint
            .step("get_genre", || async {
                genre_calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![changed("2024-01-01T11:00:00Z")])
            })
            .await
            .unwrap();
        checkpoint.finish().unwrap();

        assert_eq!(person_calls.load(Ordering::SeqCst), 0, "finished step replays from cache");
        assert_eq!(genre_calls.load(Ordering::SeqCst), 1, "broken step re-executes");
        assert_eq!(
            checkpoint.max_modified_after,
            DateTime::parse_from_rfc3339("2024-01-01T11:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
        );
    }

    #[tokio::test]
    async fn empty_result_does_not_set_has_results() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("s.json"));
        let mut checkpoint = StageCheckpoint::begin(&store, "Producer", epoch()).unwrap();
        checkpoint
            .step::<ChangedRef, _, _>("get_person", || async { Ok(vec![]) })
            .await
            .unwrap();
        checkpoint.finish().unwrap();
        assert!(!checkpoint.has_results);
        assert_eq!(checkpoint.max_modified_after, epoch());
    }
}
