//! SQLite person and embedding store.
//!
//! `people` rows own at most one `face_embeddings` row. The connection lives
//! on a background thread owned by `tokio-rusqlite`; every method suspends the
//! calling task only.

use std::path::Path;

use anchor_core::{Embedding, NewPerson, Person, PersonId, PersonPatch};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS people (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    pair_id      TEXT NOT NULL,
    name         TEXT NOT NULL,
    relationship TEXT NOT NULL,
    occupation   TEXT NOT NULL,
    age          INTEGER,
    notes        TEXT,
    image_url    TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_people_pair ON people(pair_id);

CREATE TABLE IF NOT EXISTS face_embeddings (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id  INTEGER NOT NULL UNIQUE REFERENCES people(id),
    embedding  BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
"#;

const PERSON_COLUMNS: &str =
    "id, pair_id, name, relationship, occupation, age, notes, image_url, created_at, updated_at";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A raw `face_embeddings` row joined to its person.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub person_id: PersonId,
    /// Vector length recorded at write time.
    pub dimensions: usize,
    pub blob: Vec<u8>,
}

/// Handle to the face database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Typed row mapping; NOT NULL columns are required, the rest optional.
fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get("id")?,
        pair_id: row.get("pair_id")?,
        name: row.get("name")?,
        relationship: row.get("relationship")?,
        occupation: row.get("occupation")?,
        age: row.get("age")?,
        notes: row.get("notes")?,
        image_url: row.get("image_url")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn select_person(conn: &rusqlite::Connection, id: PersonId) -> rusqlite::Result<Option<Person>> {
    conn.query_row(
        &format!("SELECT {PERSON_COLUMNS} FROM people WHERE id = ?1"),
        params![id],
        person_from_row,
    )
    .optional()
}

fn upsert_embedding(
    conn: &rusqlite::Connection,
    person_id: PersonId,
    blob: &[u8],
    dimensions: usize,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO face_embeddings (person_id, embedding, dimensions, created_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(person_id) DO UPDATE SET
            embedding = excluded.embedding,
            dimensions = excluded.dimensions,
            created_at = excluded.created_at
        "#,
        params![person_id, blob, dimensions as i64, now()],
    )?;
    Ok(())
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "face database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn insert_person(
        &self,
        person: &NewPerson,
        image_url: &str,
    ) -> Result<Person, StoreError> {
        let person = person.clone();
        let image_url = image_url.to_string();
        let created = self
            .conn
            .call(move |conn| {
                let ts = now();
                conn.execute(
                    r#"
                    INSERT INTO people
                        (pair_id, name, relationship, occupation, age, notes, image_url, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                    "#,
                    params![
                        person.pair_id,
                        person.name,
                        person.relationship,
                        person.occupation,
                        person.age,
                        person.notes,
                        image_url,
                        ts,
                    ],
                )?;
                let id = conn.last_insert_rowid();
                let row = select_person(conn, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                Ok(row)
            })
            .await?;
        Ok(created)
    }

    /// Store (or replace) the embedding for `person_id`.
    pub async fn insert_embedding(
        &self,
        person_id: PersonId,
        embedding: &Embedding,
    ) -> Result<(), StoreError> {
        let blob = embedding.to_le_bytes();
        let dims = embedding.dimensions();
        self.conn
            .call(move |conn| {
                upsert_embedding(conn, person_id, &blob, dims)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_person(&self, id: PersonId) -> Result<Option<Person>, StoreError> {
        let person = self
            .conn
            .call(move |conn| Ok(select_person(conn, id)?))
            .await?;
        Ok(person)
    }

    /// All people in a pair, in insertion order.
    pub async fn list_people(&self, pair_id: &str) -> Result<Vec<Person>, StoreError> {
        let pair_id = pair_id.to_string();
        let people = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PERSON_COLUMNS} FROM people WHERE pair_id = ?1 ORDER BY id"
                ))?;
                let rows = stmt
                    .query_map(params![pair_id], person_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(people)
    }

    /// Raw embedding blobs of every person in a pair that has one, in
    /// person insertion order.
    /// Every stored embedding for people in `pair_id`, ordered by person id.
    pub async fn stored_embeddings(&self, pair_id: &str) -> Result<Vec<StoredEmbedding>, StoreError> {
        let pair_id = pair_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT p.id, e.dimensions, e.embedding
                    FROM people p
                    JOIN face_embeddings e ON e.person_id = p.id
                    WHERE p.pair_id = ?1
                    ORDER BY p.id
                    "#,
                )?;
                let rows: Vec<StoredEmbedding> = stmt
                    .query_map(params![pair_id], |row| {
                        let dimensions: i64 = row.get(1)?;
                        Ok(StoredEmbedding {
                            person_id: row.get(0)?,
                            dimensions: usize::try_from(dimensions).unwrap_or(0),
                            blob: row.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    #[cfg(test)]
    pub async fn get_embedding(&self, person_id: PersonId) -> Result<Option<Vec<u8>>, StoreError> {
        let blob = self
            .conn
            .call(move |conn| {
                let blob: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT embedding FROM face_embeddings WHERE person_id = ?1",
                        params![person_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(blob)
            })
            .await?;
        Ok(blob)
    }

    /// Apply `patch` and, when given, overwrite the person's embedding, in a
    /// single transaction. Returns `None` if the person does not exist.
    pub async fn update_person(
        &self,
        id: PersonId,
        patch: &PersonPatch,
        embedding: Option<&Embedding>,
    ) -> Result<Option<Person>, StoreError> {
        let patch = patch.clone();
        let embedding = embedding.map(|e| (e.to_le_bytes(), e.dimensions()));
        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(mut person) = select_person(&tx, id)? else {
                    return Ok(None);
                };

                if let Some((blob, dims)) = &embedding {
                    upsert_embedding(&tx, id, blob, *dims)?;
                }

                patch.apply(&mut person);
                person.updated_at = now();
                tx.execute(
                    r#"
                    UPDATE people SET
                        name = ?2, relationship = ?3, occupation = ?4, age = ?5,
                        notes = ?6, image_url = ?7, updated_at = ?8
                    WHERE id = ?1
                    "#,
                    params![
                        id,
                        person.name,
                        person.relationship,
                        person.occupation,
                        person.age,
                        person.notes,
                        person.image_url,
                        person.updated_at,
                    ],
                )?;
                tx.commit()?;
                Ok(Some(person))
            })
            .await?;
        Ok(updated)
    }

    /// Delete the person's embedding, then the person. Returns `false`
    /// (and changes nothing) if the person does not exist.
    pub async fn delete_person(&self, id: PersonId) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM face_embeddings WHERE person_id = ?1",
                    params![id],
                )?;
                let removed = tx.execute("DELETE FROM people WHERE id = ?1", params![id])?;
                if removed == 0 {
                    return Ok(false);
                }
                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(deleted)
    }

    #[cfg(test)]
    pub async fn count_embeddings(&self) -> Result<i64, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM face_embeddings", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    #[cfg(test)]
    pub async fn execute_batch(&self, sql: &'static str) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(sql)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
