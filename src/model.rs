//! Shapes shared across pipeline stages.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sql::Row;

fn column(row: &Row, name: &str) -> Result<crate::sql::SqlValue> {
    row.get(name)
        .cloned()
        .ok_or_else(|| anyhow!("missing column `{name}` in catalog row"))
}

fn column_uuid(row: &Row, name: &str) -> Result<Uuid> {
    let text = column(row, name)?
        .as_str()
        .ok_or_else(|| anyhow!("column `{name}` is not text"))?
        .to_string();
    Uuid::parse_str(&text).with_context(|| format!("parsing `{name}` as UUID"))
}

fn column_uuid_opt(row: &Row, name: &str) -> Result<Option<Uuid>> {
    match row.get(name) {
        None | Some(crate::sql::SqlValue::Null) => Ok(None),
        Some(value) => {
            let text = value
                .as_str()
                .ok_or_else(|| anyhow!("column `{name}` is not text"))?;
            Ok(Some(Uuid::parse_str(text).with_context(|| format!("parsing `{name}` as UUID"))?))
        }
    }
}

fn column_timestamp(row: &Row, name: &str) -> Result<DateTime<Utc>> {
    column(row, name)?
        .as_datetime()
        .ok_or_else(|| anyhow!("column `{name}` is not a valid RFC3339 timestamp"))
}

fn column_text_opt(row: &Row, name: &str) -> Option<String> {
    row.get(name).and_then(|v| v.as_str().map(str::to_string))
}

/// `(id, modified)` tuple marking an entity that may need re-indexing.
/// Emitted by the Producer (for persons/genres/films themselves) and the
/// Enricher (for films reached through a changed person or genre).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedRef {
    pub id: Uuid,
    pub modified: DateTime<Utc>,
}

impl ChangedRef {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: column_uuid(row, "id")?,
            modified: column_timestamp(row, "modified")?,
        })
    }
}

/// `person_film.role`. An unrecognized value (or `NULL`, surfaced by the
/// left-outer join when a film has no linked persons at all) is ignored by
/// the transformer rather than rejected, per the merger contract: "the film
/// still materializes via its constant fields".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Actor,
    Writer,
    Director,
    Unknown,
}

impl Role {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("actor") => Role::Actor,
            Some("writer") => Role::Writer,
            Some("director") => Role::Director,
            _ => Role::Unknown,
        }
    }
}

/// One row of the wide film x person x genre join. Fields after `role` may
/// be null because both joins in the Merger query are `LEFT JOIN`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRow {
    pub fw_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub rating: Option<f64>,
    pub film_type: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub role: Option<String>,
    pub person_id: Option<Uuid>,
    pub full_name: Option<String>,
    pub genre_name: Option<String>,
}

impl JoinRow {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            fw_id: column_uuid(row, "fw_id")?,
            title: column(row, "title")?
                .as_str()
                .ok_or_else(|| anyhow!("`title` is not text"))?
                .to_string(),
            description: column_text_opt(row, "description"),
            rating: row.get("rating").and_then(|v| v.as_f64()),
            film_type: column_text_opt(row, "type"),
            created: column_timestamp(row, "created")?,
            modified: column_timestamp(row, "modified")?,
            role: column_text_opt(row, "role"),
            person_id: column_uuid_opt(row, "person_id")?,
            full_name: column_text_opt(row, "full_name"),
            genre_name: column_text_opt(row, "genre_name"),
        })
    }
}

/// `{id, name}` entry inside `FilmDoc.actors`/`.writers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: Uuid,
    pub name: String,
}

/// Shared by every checkpointed sub-method result so `analyze_result` (see
/// `checkpoint`) can find the watermark candidate without caring whether it
/// is looking at a `ChangedRef` or a `JoinRow`.
pub trait HasModified {
    fn modified(&self) -> DateTime<Utc>;
}

impl HasModified for ChangedRef {
    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }
}

impl HasModified for JoinRow {
    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }
}

/// The denormalized search-index document for one film.
///
/// Field order here is the wire order: it matches the reference `EsFilm`
/// shape field-for-field (`title.raw` and `genre.description` are
/// deliberately absent, see `SPEC_FULL.md` §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilmDoc {
    pub id: Uuid,
    pub imdb_rating: Option<f64>,
    pub genre: Vec<String>,
    pub title: String,
    pub description: Option<String>,
    pub director: Vec<String>,
    pub actors_names: Vec<String>,
    pub writers_names: Vec<String>,
    pub actors: Vec<PersonRef>,
    pub writers: Vec<PersonRef>,
}
