//! Scans the three source tables for rows changed since the watermark.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::checkpoint::StageCheckpoint;
use crate::model::ChangedRef;
use crate::sql::{qualify, sql_timestamp, SqlExecutor};
use crate::state::StateStore;

const STAGE: &str = "Producer";

/// Results of one `Producer::collect()` pass.
pub struct ProducerResult {
    pub person: Vec<ChangedRef>,
    pub genre: Vec<ChangedRef>,
    pub filmwork: Vec<ChangedRef>,
    pub has_results: bool,
    pub max_modified_after: DateTime<Utc>,
}

/// Runs the three independently-checkpointed paged queries over
/// `person`, `genre` and `film`.
pub struct Producer<'a> {
    sql: &'a SqlExecutor,
    store: &'a StateStore,
    schema: &'a str,
    watermark: DateTime<Utc>,
    limit: u32,
    offset: u32,
}

impl<'a> Producer<'a> {
    pub fn new(
        sql: &'a SqlExecutor,
        store: &'a StateStore,
        schema: &'a str,
        watermark: DateTime<Utc>,
        limit: u32,
        run_number: u32,
    ) -> Self {
        Self {
            sql,
            store,
            schema,
            watermark,
            limit,
            offset: limit * run_number.saturating_sub(1),
        }
    }

    async fn page(&self, table: &str) -> Result<Vec<ChangedRef>> {
        let query = format!(
            "SELECT id, modified FROM {table} WHERE modified > {watermark} \
             ORDER BY modified LIMIT {limit} OFFSET {offset}",
            table = qualify(self.schema, table),
            watermark = sql_timestamp(self.watermark),
            limit = self.limit,
            offset = self.offset,
        );
        let rows = self.sql.execute(&query).await?;
        rows.iter().map(ChangedRef::from_row).collect()
    }

    pub async fn collect(&self) -> Result<ProducerResult> {
        let mut checkpoint = StageCheckpoint::begin(self.store, STAGE, self.watermark)?;

        let person = checkpoint.step("get_person", || self.page("person")).await?;
        let genre = checkpoint.step("get_genre", || self.page("genre")).await?;
        let filmwork = checkpoint.step("get_filmwork", || self.page("film")).await?;

        let has_results = checkpoint.has_results;
        let max_modified_after = checkpoint.max_modified_after;
        checkpoint.finish()?;

        Ok(ProducerResult {
            person,
            genre,
            filmwork,
            has_results,
            max_modified_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn seeded_db() -> SqlExecutor {
        let sql = SqlExecutor::open_local(":memory:").await.unwrap();
        sql.execute("CREATE TABLE person (id TEXT, modified TEXT)")
            .await
            .unwrap();
        sql.execute("CREATE TABLE genre (id TEXT, modified TEXT)")
            .await
            .unwrap();
        sql.execute("CREATE TABLE film (id TEXT, modified TEXT)")
            .await
            .unwrap();
        sql
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("1970-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn empty_tables_report_no_results() {
        let sql = seeded_db().await;
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("producer.json"));
        let producer = Producer::new(&sql, &store, "", epoch(), 100, 1);
        let result = producer.collect().await.unwrap();
        assert!(!result.has_results);
        assert!(result.person.is_empty());
        assert!(result.genre.is_empty());
        assert!(result.filmwork.is_empty());
        assert_eq!(result.max_modified_after, epoch());
    }

    #[tokio::test]
    async fn new_film_is_picked_up_and_advances_watermark() {
        let sql = seeded_db().await;
        sql.execute(
            "INSERT INTO film (id, modified) VALUES ('11111111-1111-1111-1111-111111111111', '2024-01-01T10:00:00+00:00')",
        )
        .await
        .unwrap();
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("producer.json"));
        let producer = Producer::new(&sql, &store, "", epoch(), 100, 1);
        let result = producer.collect().await.unwrap();
        assert!(result.has_results);
        assert_eq!(result.filmwork.len(), 1);
        assert_eq!(
            result.max_modified_after,
            DateTime::parse_from_rfc3339("2024-01-01T10:00:00+00:00")
                .unwrap()
                .with_timezone(&Utc)
        );
    }

    #[tokio::test]
    async fn crash_before_final_finish_replays_every_submethod_from_cache() {
        let sql = seeded_db().await;
        sql.execute(
            "INSERT INTO film (id, modified) VALUES ('11111111-1111-1111-1111-111111111111', '2024-01-01T10:00:00+00:00')",
        )
        .await
        .unwrap();
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("producer.json"));
        let producer = Producer::new(&sql, &store, "", epoch(), 100, 1);
        producer.collect().await.unwrap();

        // Simulate a crash between the last sub-method's FINISH and the
        // stage's own overall FINISH write.
        store.set("Producer", &crate::state::CacheState::Start).unwrap();

        // Drop the tables to prove the replay never touches SQL.
        sql.execute("DROP TABLE person").await.unwrap();
        sql.execute("DROP TABLE genre").await.unwrap();
        sql.execute("DROP TABLE film").await.unwrap();

        let producer_again = Producer::new(&sql, &store, "", epoch(), 100, 1);
        let result = producer_again.collect().await.unwrap();
        assert!(result.has_results);
        assert_eq!(result.filmwork.len(), 1);
    }
}
