//! Resolves enriched film-ids into the full film x person x genre rows the
//! transformer needs.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::checkpoint::StageCheckpoint;
use crate::enricher::EnricherResult;
use crate::model::JoinRow;
use crate::sql::{qualify, sql_uuid_list, SqlExecutor};
use crate::state::StateStore;

const STAGE: &str = "Merger";

pub struct MergerResult {
    pub rows: Vec<JoinRow>,
    pub has_results: bool,
    pub max_modified_after: DateTime<Utc>,
}

/// Runs the single wide join query over the union of film-ids the Enricher
/// surfaced, plus whatever subset of the Producer's own `filmwork` page the
/// caller still owes a merge. A film that changed on its own row but has no
/// linked person/genre change never appears in either Enricher link list, so
/// without folding the Producer's film-ids in here directly it would never
/// reach a Merger call at all.
pub struct Merger<'a> {
    sql: &'a SqlExecutor,
    store: &'a StateStore,
    schema: &'a str,
    film_ids: Vec<Uuid>,
    watermark: DateTime<Utc>,
}

impl<'a> Merger<'a> {
    /// `producer_filmwork` is the Producer's own changed-film page (or a
    /// subset of it, or empty) - see the struct doc. The caller decides how
    /// much of it to fold into any one Merger call; this constructor just
    /// unions whatever it is given with the Enricher's link lists.
    pub fn new(
        sql: &'a SqlExecutor,
        store: &'a StateStore,
        schema: &'a str,
        enricher: &EnricherResult,
        producer_filmwork: &[Uuid],
        watermark: DateTime<Utc>,
    ) -> Self {
        let mut ids: BTreeSet<Uuid> = BTreeSet::new();
        ids.extend(enricher.person_links.iter().map(|c| c.id));
        ids.extend(enricher.genre_links.iter().map(|c| c.id));
        ids.extend(producer_filmwork.iter().copied());
        Self {
            sql,
            store,
            schema,
            film_ids: ids.into_iter().collect(),
            watermark,
        }
    }

    async fn get_films_linked(&self) -> Result<Vec<JoinRow>> {
        if self.film_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT \
                fw.id AS fw_id, fw.title AS title, fw.description AS description, \
                fw.rating AS rating, fw.type AS type, fw.created AS created, \
                fw.modified AS modified, pfw.role AS role, p.id AS person_id, \
                p.full_name AS full_name, g.name AS genre_name \
             FROM {film} fw \
             LEFT JOIN {person_film} pfw ON pfw.film_id = fw.id \
             LEFT JOIN {person} p ON p.id = pfw.person_id \
             LEFT JOIN {genre_film} gfw ON gfw.film_id = fw.id \
             LEFT JOIN {genre} g ON g.id = gfw.genre_id \
             WHERE fw.id IN ({ids})",
            film = qualify(self.schema, "film"),
            person_film = qualify(self.schema, "person_film"),
            person = qualify(self.schema, "person"),
            genre_film = qualify(self.schema, "genre_film"),
            genre = qualify(self.schema, "genre"),
            ids = sql_uuid_list(self.film_ids.iter().copied()),
        );
        let rows = self.sql.execute(&query).await?;
        rows.iter().map(JoinRow::from_row).collect()
    }

    pub async fn collect(&self) -> Result<MergerResult> {
        let mut checkpoint = StageCheckpoint::begin(self.store, STAGE, self.watermark)?;
        let rows = checkpoint
            .step("get_films_linked", || self.get_films_linked())
            .await?;
        let has_results = checkpoint.has_results;
        let max_modified_after = checkpoint.max_modified_after;
        checkpoint.finish()?;
        Ok(MergerResult {
            rows,
            has_results,
            max_modified_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChangedRef;
    use tempfile::tempdir;

    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("1970-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn seeded_db() -> SqlExecutor {
        let sql = SqlExecutor::open_local(":memory:").await.unwrap();
        sql.execute(
            "CREATE TABLE film (id TEXT, title TEXT, description TEXT, rating REAL, type TEXT, created TEXT, modified TEXT)",
        )
        .await
        .unwrap();
        sql.execute("CREATE TABLE person (id TEXT, full_name TEXT)")
            .await
            .unwrap();
        sql.execute("CREATE TABLE person_film (film_id TEXT, person_id TEXT, role TEXT)")
            .await
            .unwrap();
        sql.execute("CREATE TABLE genre (id TEXT, name TEXT)")
            .await
            .unwrap();
        sql.execute("CREATE TABLE genre_film (film_id TEXT, genre_id TEXT)")
            .await
            .unwrap();
        sql
    }

    #[tokio::test]
    async fn empty_film_id_union_skips_sql_entirely() {
        let sql = seeded_db().await;
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("merger.json"));
        let enricher = EnricherResult {
            person_links: vec![],
            genre_links: vec![],
            has_results: false,
            max_modified_after: epoch(),
        };
        let merger = Merger::new(&sql, &store, "", &enricher, &[], epoch());
        let result = merger.collect().await.unwrap();
        assert!(!result.has_results);
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn wide_join_returns_one_row_per_person_genre_pair() {
        let sql = seeded_db().await;
        let film = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let genre = Uuid::new_v4();
        sql.execute(&format!(
            "INSERT INTO film (id, title, description, rating, type, created, modified) VALUES \
             ('{film}', 'Arrival', 'A film', 8.5, 'movie', '2024-01-01T00:00:00+00:00', '2024-01-02T00:00:00+00:00')"
        ))
        .await
        .unwrap();
        sql.execute(&format!(
            "INSERT INTO person (id, full_name) VALUES ('{actor}', 'Amy Adams')"
        ))
        .await
        .unwrap();
        sql.execute(&format!(
            "INSERT INTO person_film (film_id, person_id, role) VALUES ('{film}', '{actor}', 'actor')"
        ))
        .await
        .unwrap();
        sql.execute(&format!("INSERT INTO genre (id, name) VALUES ('{genre}', 'Sci-Fi')"))
            .await
            .unwrap();
        sql.execute(&format!(
            "INSERT INTO genre_film (film_id, genre_id) VALUES ('{film}', '{genre}')"
        ))
        .await
        .unwrap();

        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("merger.json"));
        let enricher = EnricherResult {
            person_links: vec![ChangedRef {
                id: film,
                modified: Utc::now(),
            }],
            genre_links: vec![],
            has_results: true,
            max_modified_after: epoch(),
        };
        let merger = Merger::new(&sql, &store, "", &enricher, &[], epoch());
        let result = merger.collect().await.unwrap();
        assert!(result.has_results);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].full_name.as_deref(), Some("Amy Adams"));
        assert_eq!(result.rows[0].genre_name.as_deref(), Some("Sci-Fi"));
    }
}
