//! Postgres-backed subject store and ledger.
//!
//! Each interaction kind has its own table (`subject_views`,
//! `subject_downloads`, `subject_likes`) whose primary key is the composite
//! document id `"{subject}_{actor}"`. Create-if-absent is therefore a single
//! `INSERT .. ON CONFLICT DO NOTHING`, never a query followed by a write.
//!
//! ## Error Mapping
//!
//! | SQLx error | StoreError |
//! |------------|------------|
//! | Database, `40001` / `40P01` (serialization failure, deadlock) | `Conflict` |
//! | Database, other codes | `Unavailable` |
//! | PoolTimedOut, PoolClosed, Io, Tls | `Unavailable` |
//! | ColumnDecode, Decode, TypeNotFound | `Corrupt` |
//! | anything else | `Unavailable` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use glyphmart_core::{ActorId, ActorKey, Counters, InteractionKey, InteractionKind, Subject, SubjectId};

use super::r#trait::{EventLedger, StoreError, StoreStats, SubjectStore, ToggleOutcome};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS subjects (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        title TEXT NOT NULL,
        views BIGINT NOT NULL DEFAULT 0 CHECK (views >= 0),
        downloads BIGINT NOT NULL DEFAULT 0 CHECK (downloads >= 0),
        likes BIGINT NOT NULL DEFAULT 0 CHECK (likes >= 0),
        last_count_sync TIMESTAMPTZ NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS subjects_downloads_idx ON subjects (downloads DESC, id)",
    "CREATE INDEX IF NOT EXISTS subjects_views_idx ON subjects (views DESC, id)",
    "CREATE INDEX IF NOT EXISTS subjects_likes_idx ON subjects (likes DESC, id)",
];

fn collection_schema(kind: InteractionKind) -> [String; 3] {
    let table = kind.collection();
    [
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                doc_id TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL,
                actor_key TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#
        ),
        format!("CREATE INDEX IF NOT EXISTS {table}_subject_idx ON {table} (subject_id)"),
        format!("CREATE INDEX IF NOT EXISTS {table}_actor_idx ON {table} (actor_key)"),
    ]
}

fn counter_column(kind: InteractionKind) -> &'static str {
    match kind {
        InteractionKind::View => "views",
        InteractionKind::Download => "downloads",
        InteractionKind::Like => "likes",
    }
}

/// Postgres-backed store.
///
/// Event writes and counter deltas share one transaction. Toggles lock the
/// subject row (`SELECT .. FOR UPDATE`), which serialises them per subject.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if missing. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        for kind in InteractionKind::ALL {
            for statement in collection_schema(kind) {
                sqlx::query(&statement)
                    .execute(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            }
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))
    }
}

const SUBJECT_COLUMNS: &str = "id, owner, title, views, downloads, likes, last_count_sync, created_at";

fn subject_from_row(row: &PgRow) -> Result<Subject, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Corrupt(format!("subject row: {e}"));
    let id: String = row.try_get("id").map_err(decode)?;
    let owner: String = row.try_get("owner").map_err(decode)?;
    let views: i64 = row.try_get("views").map_err(decode)?;
    let downloads: i64 = row.try_get("downloads").map_err(decode)?;
    let likes: i64 = row.try_get("likes").map_err(decode)?;

    Ok(Subject {
        id: SubjectId::parse(id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        owner: ActorId::parse(owner).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        title: row.try_get("title").map_err(decode)?,
        counters: Counters::new(to_count(views)?, to_count(downloads)?, to_count(likes)?),
        last_count_sync: row.try_get("last_count_sync").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

fn to_count(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative counter {value}")))
}

fn to_db(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("counter {value} out of range")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            StoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => StoreError::Unavailable(format!("connection pool closed in {operation}")),
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

/// Row-lock the subject for the rest of `tx`. Ledger writes and subject
/// deletion all take this lock, so no event can land between a delete's
/// ledger sweep and its row removal. Returns `false` if the subject is gone.
async fn lock_subject(tx: &mut Transaction<'static, Postgres>, id: &SubjectId, operation: &str) -> Result<bool, StoreError> {
    let locked = sqlx::query("SELECT id FROM subjects WHERE id = $1 FOR UPDATE")
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(locked.is_some())
}

#[async_trait]
impl SubjectStore for PostgresStore {
    #[instrument(skip(self), fields(subject_id = %id), err)]
    async fn get_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_subject", e))?;
        row.as_ref().map(subject_from_row).transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_subjects(&self, ids: &[SubjectId]) -> Result<Vec<Subject>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let raw: Vec<&str> = ids.iter().map(SubjectId::as_str).collect();
        let rows = sqlx::query(&format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE id = ANY($1)"))
            .bind(raw)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_subjects", e))?;
        rows.iter().map(subject_from_row).collect()
    }

    async fn list_subject_ids(
        &self,
        after: Option<&SubjectId>,
        limit: usize,
    ) -> Result<Vec<SubjectId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM subjects
            WHERE ($1::text IS NULL OR id > $1)
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(after.map(SubjectId::as_str))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_subject_ids", e))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| StoreError::Corrupt(format!("subject id: {e}")))?;
                SubjectId::parse(id).map_err(|e| StoreError::Corrupt(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self, subject), fields(subject_id = %subject.id), err)]
    async fn put_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subjects (id, owner, title, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                owner = EXCLUDED.owner,
                title = EXCLUDED.title
            "#,
        )
        .bind(subject.id.as_str())
        .bind(subject.owner.as_str())
        .bind(&subject.title)
        .bind(subject.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put_subject", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(subject_id = %id), err)]
    async fn delete_subject(&self, id: &SubjectId) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;
        if !lock_subject(&mut tx, id, "delete_subject").await? {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }
        for kind in InteractionKind::ALL {
            sqlx::query(&format!("DELETE FROM {} WHERE subject_id = $1", kind.collection()))
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_subject", e))?;
        }
        let deleted = sqlx::query("DELETE FROM subjects WHERE id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_subject", e))?
            .rows_affected();
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(deleted > 0)
    }

    #[instrument(skip(self), fields(subject_id = %id), err)]
    async fn replace_counters(
        &self,
        id: &SubjectId,
        observed: Counters,
        new: Counters,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE subjects
            SET views = $5, downloads = $6, likes = $7, last_count_sync = $8
            WHERE id = $1 AND views = $2 AND downloads = $3 AND likes = $4
            "#,
        )
        .bind(id.as_str())
        .bind(to_db(observed.views)?)
        .bind(to_db(observed.downloads)?)
        .bind(to_db(observed.likes)?)
        .bind(to_db(new.views)?)
        .bind(to_db(new.downloads)?)
        .bind(to_db(new.likes)?)
        .bind(synced_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("replace_counters", e))?
        .rows_affected();

        if updated > 0 {
            return Ok(());
        }

        // Distinguish a lost race from a deleted subject.
        let exists = sqlx::query("SELECT 1 FROM subjects WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("replace_counters", e))?
            .is_some();
        if exists {
            Err(StoreError::Conflict(format!("counters of {id} changed since they were read")))
        } else {
            Err(StoreError::SubjectNotFound(id.clone()))
        }
    }

    async fn top_subjects(&self, kind: InteractionKind, limit: usize) -> Result<Vec<Subject>, StoreError> {
        let column = counter_column(kind);
        let rows = sqlx::query(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects ORDER BY {column} DESC, id ASC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("top_subjects", e))?;
        rows.iter().map(subject_from_row).collect()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM subjects) AS subjects,
                (SELECT COUNT(*) FROM subject_views) AS views,
                (SELECT COUNT(*) FROM subject_downloads) AS downloads,
                (SELECT COUNT(*) FROM subject_likes) AS likes
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let get = |name: &str| -> Result<u64, StoreError> {
            let v: i64 = row
                .try_get(name)
                .map_err(|e| StoreError::Corrupt(format!("stats.{name}: {e}")))?;
            to_count(v)
        };
        Ok(StoreStats {
            subjects: get("subjects")?,
            events: Counters::new(get("views")?, get("downloads")?, get("likes")?),
        })
    }
}

#[async_trait]
impl EventLedger for PostgresStore {
    #[instrument(skip(self, key), fields(subject_id = %key.subject, kind = %key.kind), err)]
    async fn record_if_absent(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;
        if !lock_subject(&mut tx, &key.subject, "record_if_absent").await? {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::SubjectNotFound(key.subject.clone()));
        }

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {} (doc_id, subject_id, actor_key, recorded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (doc_id) DO NOTHING
            "#,
            key.kind.collection()
        ))
        .bind(key.document_id())
        .bind(key.subject.as_str())
        .bind(key.actor.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_if_absent", e))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }

        let column = counter_column(key.kind);
        let bumped = sqlx::query(&format!("UPDATE subjects SET {column} = {column} + 1 WHERE id = $1"))
            .bind(key.subject.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_if_absent", e))?
            .rows_affected();

        if bumped == 0 {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::SubjectNotFound(key.subject.clone()));
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(true)
    }

    #[instrument(skip(self, key), fields(subject_id = %key.subject, kind = %key.kind), err)]
    async fn toggle(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<ToggleOutcome, StoreError> {
        let mut tx = self.begin().await?;
        let column = counter_column(key.kind);
        let table = key.kind.collection();

        if !lock_subject(&mut tx, &key.subject, "toggle").await? {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::SubjectNotFound(key.subject.clone()));
        }

        let removed = sqlx::query(&format!("DELETE FROM {table} WHERE doc_id = $1"))
            .bind(key.document_id())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("toggle", e))?
            .rows_affected();

        let present = removed == 0;
        if present {
            sqlx::query(&format!(
                "INSERT INTO {table} (doc_id, subject_id, actor_key, recorded_at) VALUES ($1, $2, $3, $4)"
            ))
            .bind(key.document_id())
            .bind(key.subject.as_str())
            .bind(key.actor.as_str())
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("toggle", e))?;
        }

        let update = if present {
            format!("UPDATE subjects SET {column} = {column} + 1 WHERE id = $1 RETURNING {column}")
        } else {
            format!("UPDATE subjects SET {column} = GREATEST({column} - 1, 0) WHERE id = $1 RETURNING {column}")
        };
        let row = sqlx::query(&update)
            .bind(key.subject.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("toggle", e))?;
        let total: i64 = row
            .try_get(column)
            .map_err(|e| StoreError::Corrupt(format!("toggle counter: {e}")))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(ToggleOutcome {
            present,
            total: to_count(total)?,
        })
    }

    async fn contains(&self, key: &InteractionKey) -> Result<bool, StoreError> {
        let row = sqlx::query(&format!("SELECT 1 FROM {} WHERE doc_id = $1", key.kind.collection()))
            .bind(key.document_id())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("contains", e))?;
        Ok(row.is_some())
    }

    async fn count(&self, subject: &SubjectId, kind: InteractionKind) -> Result<u64, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(doc_id) AS total FROM {} WHERE subject_id = $1",
            kind.collection()
        ))
        .bind(subject.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| StoreError::Corrupt(format!("count: {e}")))?;
        to_count(total)
    }

    async fn subjects_for_actor(&self, actor: &ActorKey, kind: InteractionKind) -> Result<Vec<SubjectId>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT subject_id FROM {} WHERE actor_key = $1 ORDER BY recorded_at DESC",
            kind.collection()
        ))
        .bind(actor.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("subjects_for_actor", e))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("subject_id")
                    .map_err(|e| StoreError::Corrupt(format!("subject id: {e}")))?;
                SubjectId::parse(id).map_err(|e| StoreError::Corrupt(e.to_string()))
            })
            .collect()
    }
}

/// Postgres-backed integration tests (require `DATABASE_URL`).
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Option<PostgresStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        PostgresStore::connect(&url).await.ok()
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn record_and_toggle_round_trip() {
        let Some(store) = store().await else {
            return;
        };
        let owner = ActorId::parse("pg-owner").unwrap();
        let subject = Subject::new(SubjectId::new(), owner, "pg", Utc::now()).unwrap();
        store.put_subject(&subject).await.unwrap();

        let view = InteractionKey::new(subject.id.clone(), ActorKey::parse("203.0.113.1").unwrap(), InteractionKind::View);
        assert!(store.record_if_absent(&view, Utc::now()).await.unwrap());
        assert!(!store.record_if_absent(&view, Utc::now()).await.unwrap());
        assert_eq!(store.count(&subject.id, InteractionKind::View).await.unwrap(), 1);

        let like = InteractionKey::new(subject.id.clone(), ActorKey::parse("pg-user").unwrap(), InteractionKind::Like);
        assert_eq!(store.toggle(&like, Utc::now()).await.unwrap(), ToggleOutcome { present: true, total: 1 });
        assert_eq!(store.toggle(&like, Utc::now()).await.unwrap(), ToggleOutcome { present: false, total: 0 });

        assert!(store.delete_subject(&subject.id).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn records_racing_a_delete_leave_no_orphans() {
        let Some(store) = store().await else {
            return;
        };
        let store = std::sync::Arc::new(store);
        let owner = ActorId::parse("pg-owner").unwrap();
        let subject = Subject::new(SubjectId::new(), owner, "pg", Utc::now()).unwrap();
        store.put_subject(&subject).await.unwrap();

        let mut tasks = Vec::new();
        for n in 0..20 {
            let store = store.clone();
            let key = InteractionKey::new(
                subject.id.clone(),
                ActorKey::parse(&format!("198.51.100.{n}")).unwrap(),
                InteractionKind::View,
            );
            tasks.push(tokio::spawn(async move { store.record_if_absent(&key, Utc::now()).await }));
        }
        assert!(store.delete_subject(&subject.id).await.unwrap());
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) | Err(StoreError::SubjectNotFound(_)) => {}
                Err(e) => panic!("unexpected store error: {e}"),
            }
        }

        assert_eq!(store.count(&subject.id, InteractionKind::View).await.unwrap(), 0);
        assert!(store.get_subject(&subject.id).await.unwrap().is_none());
    }
}
