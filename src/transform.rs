//! Groups the Merger's wide join rows into one `FilmDoc` per film.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use uuid::Uuid;

use crate::model::{FilmDoc, JoinRow, PersonRef, Role};

struct Draft {
    title: String,
    description: Option<String>,
    rating: Option<f64>,
    genre: IndexSet<String>,
    director: IndexSet<String>,
    actors: IndexMap<Uuid, String>,
    writers: IndexMap<Uuid, String>,
}

impl Draft {
    fn new(row: &JoinRow) -> Self {
        Self {
            title: row.title.clone(),
            description: row.description.clone(),
            rating: row.rating,
            genre: IndexSet::new(),
            director: IndexSet::new(),
            actors: IndexMap::new(),
            writers: IndexMap::new(),
        }
    }
}

/// Folds every `JoinRow` belonging to the same film into one `FilmDoc`.
///
/// Two passes over the rows: the first groups by `fw_id` and accumulates
/// genre/director names and actor/writer `(id, name)` pairs in first-seen
/// order, using the last value seen for a given person id if the same id
/// ever recurs with a different name within one batch. The second pass
/// turns each draft into the document's final field shapes.
pub fn transform(rows: &[JoinRow]) -> HashMap<Uuid, FilmDoc> {
    let mut drafts: IndexMap<Uuid, Draft> = IndexMap::new();

    for row in rows {
        let draft = drafts.entry(row.fw_id).or_insert_with(|| Draft::new(row));

        if let Some(genre_name) = &row.genre_name {
            draft.genre.insert(genre_name.clone());
        }

        match (Role::parse(row.role.as_deref()), row.person_id, &row.full_name) {
            (Role::Actor, Some(id), Some(name)) => {
                draft.actors.insert(id, name.clone());
            }
            (Role::Writer, Some(id), Some(name)) => {
                draft.writers.insert(id, name.clone());
            }
            (Role::Director, _, Some(name)) => {
                draft.director.insert(name.clone());
            }
            _ => {}
        }
    }

    drafts
        .into_iter()
        .map(|(id, draft)| {
            let actors: Vec<PersonRef> = draft
                .actors
                .into_iter()
                .map(|(id, name)| PersonRef { id, name })
                .collect();
            let writers: Vec<PersonRef> = draft
                .writers
                .into_iter()
                .map(|(id, name)| PersonRef { id, name })
                .collect();
            let actors_names = actors.iter().map(|p| p.name.clone()).collect();
            let writers_names = writers.iter().map(|p| p.name.clone()).collect();

            (
                id,
                FilmDoc {
                    id,
                    imdb_rating: draft.rating,
                    genre: draft.genre.into_iter().collect(),
                    title: draft.title,
                    description: draft.description,
                    director: draft.director.into_iter().collect(),
                    actors_names,
                    writers_names,
                    actors,
                    writers,
                },
            )
        })
        .collect()
}
