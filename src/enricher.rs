//! Resolves the person-ids and genre-ids a Producer page found into the
//! film-ids that must be re-indexed because of them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::checkpoint::StageCheckpoint;
use crate::model::ChangedRef;
use crate::producer::ProducerResult;
use crate::sql::{qualify, sql_uuid_list, SqlExecutor};
use crate::state::StateStore;

const STAGE: &str = "Enricher";

pub struct EnricherResult {
    pub person_links: Vec<ChangedRef>,
    pub genre_links: Vec<ChangedRef>,
    pub has_results: bool,
    pub max_modified_after: DateTime<Utc>,
}

/// One page of films reachable through the changed persons/genres a
/// Producer page surfaced.
pub struct Enricher<'a> {
    sql: &'a SqlExecutor,
    store: &'a StateStore,
    schema: &'a str,
    person_ids: Vec<Uuid>,
    genre_ids: Vec<Uuid>,
    watermark: DateTime<Utc>,
    limit: u32,
    offset: u32,
}

impl<'a> Enricher<'a> {
    pub fn new(
        sql: &'a SqlExecutor,
        store: &'a StateStore,
        schema: &'a str,
        producer: &ProducerResult,
        watermark: DateTime<Utc>,
        limit: u32,
        page_number: u32,
    ) -> Self {
        Self {
            sql,
            store,
            schema,
            person_ids: producer.person.iter().map(|c| c.id).collect(),
            genre_ids: producer.genre.iter().map(|c| c.id).collect(),
            watermark,
            limit,
            offset: limit * page_number.saturating_sub(1),
        }
    }

    async fn links_via(&self, ids: &[Uuid], link_table: &str, fk: &str) -> Result<Vec<ChangedRef>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT fw.id, fw.modified FROM {film} fw \
             LEFT JOIN {link} pfw ON pfw.film_id = fw.id \
             WHERE pfw.{fk} IN ({ids}) \
             ORDER BY fw.modified LIMIT {limit} OFFSET {offset}",
            film = qualify(self.schema, "film"),
            link = qualify(self.schema, link_table),
            fk = fk,
            ids = sql_uuid_list(ids.iter().copied()),
            limit = self.limit,
            offset = self.offset,
        );
        let rows = self.sql.execute(&query).await?;
        rows.iter().map(ChangedRef::from_row).collect()
    }

    pub async fn collect(&self) -> Result<EnricherResult> {
        let mut checkpoint = StageCheckpoint::begin(self.store, STAGE, self.watermark)?;

        let person_links = checkpoint
            .step("get_person_links", || {
                self.links_via(&self.person_ids, "person_film", "person_id")
            })
            .await?;
        let genre_links = checkpoint
            .step("get_genre_links", || {
                self.links_via(&self.genre_ids, "genre_film", "genre_id")
            })
            .await?;

        let has_results = checkpoint.has_results;
        let max_modified_after = checkpoint.max_modified_after;
        checkpoint.finish()?;

        Ok(EnricherResult {
            person_links,
            genre_links,
            has_results,
            max_modified_after,
        })
    }
}
