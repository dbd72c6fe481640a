//! SQLite-backed [`ArtifactRepository`].
//!
//! Each record is stored as its JSON document next to the key columns it is
//! looked up by. Key uniqueness is enforced by the schema, so find-or-create
//! and upserts are single `INSERT ... ON CONFLICT` statements.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;
use vderive_models::{DedupKey, FileId, FormatId, VideoArtifact, VideoFormat, VideoFrame, VideoJob};

use crate::error::{CatalogError, CatalogResult};
use crate::repository::ArtifactRepository;
use crate::scope::CleanupScope;

/// The source rendition has no format; it is keyed by the empty string so
/// the composite keys stay `NOT NULL` and unique.
const SOURCE_FORMAT: &str = "";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS artifacts (
    source_file_id TEXT NOT NULL,
    format_id TEXT NOT NULL,
    file_id TEXT,
    record TEXT NOT NULL,
    PRIMARY KEY (source_file_id, format_id)
);
CREATE INDEX IF NOT EXISTS idx_artifacts_file ON artifacts(file_id);
CREATE INDEX IF NOT EXISTS idx_artifacts_format ON artifacts(format_id);

CREATE TABLE IF NOT EXISTS formats (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    record TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS frames (
    source_file_id TEXT NOT NULL,
    format_id TEXT NOT NULL,
    frame_index INTEGER NOT NULL,
    file_id TEXT NOT NULL,
    record TEXT NOT NULL,
    PRIMARY KEY (source_file_id, format_id, frame_index)
);
CREATE INDEX IF NOT EXISTS idx_frames_file ON frames(file_id);
CREATE INDEX IF NOT EXISTS idx_frames_format ON frames(format_id);

CREATE TABLE IF NOT EXISTS jobs (
    kind TEXT NOT NULL,
    source_file_id TEXT NOT NULL,
    format_id TEXT NOT NULL,
    job_id TEXT NOT NULL,
    record TEXT NOT NULL,
    PRIMARY KEY (kind, source_file_id, format_id)
);
CREATE INDEX IF NOT EXISTS idx_jobs_format ON jobs(format_id);
"#;

/// Catalog records in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteArtifactRepository {
    pool: SqlitePool,
}

impl SqliteArtifactRepository {
    /// Open (creating if missing) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let repo = Self { pool };
        repo.migrate().await?;
        info!(path = %path.display(), "Opened catalog database");
        Ok(repo)
    }

    /// Open a private in-memory database that lives as long as this value.
    pub async fn in_memory() -> CatalogResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> CatalogResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn records_in(
        &self,
        table: &str,
        order: &str,
        scope: &CleanupScope,
    ) -> CatalogResult<Vec<String>> {
        let (filter, values) = scope_filter(scope);
        let sql = format!("SELECT record FROM {table} WHERE {filter} ORDER BY {order}");
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for value in values {
            query = query.bind(value);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }
}

fn format_key(format_id: Option<&FormatId>) -> &str {
    format_id.map_or(SOURCE_FORMAT, |f| f.as_str())
}

fn scope_filter(scope: &CleanupScope) -> (&'static str, Vec<&str>) {
    match scope {
        CleanupScope::Exact { source, format_id } => (
            "source_file_id = ? AND format_id = ?",
            vec![source.as_str(), format_key(format_id.as_ref())],
        ),
        CleanupScope::Cascade { source } => ("source_file_id = ?", vec![source.as_str()]),
        CleanupScope::Format { format_id } => ("format_id = ?", vec![format_id.as_str()]),
    }
}

fn encode<T: Serialize>(record: &T) -> CatalogResult<String> {
    Ok(serde_json::to_string(record)?)
}

fn decode<T: DeserializeOwned>(record: Option<String>) -> CatalogResult<Option<T>> {
    record
        .map(|r| serde_json::from_str(&r))
        .transpose()
        .map_err(Into::into)
}

fn decode_all<T: DeserializeOwned>(records: Vec<String>) -> CatalogResult<Vec<T>> {
    records
        .iter()
        .map(|r| serde_json::from_str::<T>(r).map_err(CatalogError::from))
        .collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl ArtifactRepository for SqliteArtifactRepository {
    async fn get_or_create_artifact(
        &self,
        source: &FileId,
        format: Option<&VideoFormat>,
    ) -> CatalogResult<VideoArtifact> {
        let artifact = match format {
            Some(format) => {
                VideoArtifact::rendition(source.clone(), format.id.clone(), Some(format.name.clone()))
            }
            None => VideoArtifact::source(source.clone()),
        };
        let format_id = format_key(artifact.format_id.as_ref());

        sqlx::query(
            "INSERT INTO artifacts (source_file_id, format_id, file_id, record) VALUES (?, ?, ?, ?) \
             ON CONFLICT (source_file_id, format_id) DO NOTHING",
        )
        .bind(source.as_str())
        .bind(format_id)
        .bind(artifact.file_id.as_ref().map(|f| f.as_str()))
        .bind(encode(&artifact)?)
        .execute(&self.pool)
        .await?;

        let record = sqlx::query_scalar::<_, String>(
            "SELECT record FROM artifacts WHERE source_file_id = ? AND format_id = ?",
        )
        .bind(source.as_str())
        .bind(format_id)
        .fetch_optional(&self.pool)
        .await?;

        decode::<VideoArtifact>(record)?.ok_or_else(|| {
            CatalogError::not_found(format!("Rendition {}:{} was removed", source, format_id))
        })
    }

    async fn find_artifact(
        &self,
        source: &FileId,
        format_id: Option<&FormatId>,
    ) -> CatalogResult<Option<VideoArtifact>> {
        let record = sqlx::query_scalar::<_, String>(
            "SELECT record FROM artifacts WHERE source_file_id = ? AND format_id = ?",
        )
        .bind(source.as_str())
        .bind(format_key(format_id))
        .fetch_optional(&self.pool)
        .await?;
        decode(record)
    }

    async fn find_artifact_by_file(&self, file_id: &FileId) -> CatalogResult<Option<VideoArtifact>> {
        let record =
            sqlx::query_scalar::<_, String>("SELECT record FROM artifacts WHERE file_id = ? LIMIT 1")
                .bind(file_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        decode(record)
    }

    async fn save_artifact(&self, artifact: VideoArtifact) -> CatalogResult<()> {
        sqlx::query(
            "INSERT INTO artifacts (source_file_id, format_id, file_id, record) VALUES (?, ?, ?, ?) \
             ON CONFLICT (source_file_id, format_id) \
             DO UPDATE SET file_id = excluded.file_id, record = excluded.record",
        )
        .bind(artifact.source_file_id.as_str())
        .bind(format_key(artifact.format_id.as_ref()))
        .bind(artifact.file_id.as_ref().map(|f| f.as_str()))
        .bind(encode(&artifact)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_artifact(
        &self,
        source: &FileId,
        format_id: Option<&FormatId>,
    ) -> CatalogResult<Option<VideoArtifact>> {
        let record = sqlx::query_scalar::<_, String>(
            "DELETE FROM artifacts WHERE source_file_id = ? AND format_id = ? RETURNING record",
        )
        .bind(source.as_str())
        .bind(format_key(format_id))
        .fetch_optional(&self.pool)
        .await?;
        decode(record)
    }

    async fn artifacts_in(&self, scope: &CleanupScope) -> CatalogResult<Vec<VideoArtifact>> {
        decode_all(
            self.records_in("artifacts", "source_file_id, format_id", scope)
                .await?,
        )
    }

    async fn insert_format(&self, format: VideoFormat) -> CatalogResult<()> {
        let result = sqlx::query("INSERT INTO formats (id, name, record) VALUES (?, ?, ?)")
            .bind(format.id.as_str())
            .bind(format.name.as_str())
            .bind(encode(&format)?)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CatalogError::already_exists(format!(
                "Format with name '{}' already exists",
                format.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_format(&self, id: &FormatId) -> CatalogResult<Option<VideoFormat>> {
        let record = sqlx::query_scalar::<_, String>("SELECT record FROM formats WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        decode(record)
    }

    async fn find_format_by_name(&self, name: &str) -> CatalogResult<Option<VideoFormat>> {
        let record = sqlx::query_scalar::<_, String>("SELECT record FROM formats WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        decode(record)
    }

    async fn list_formats(&self) -> CatalogResult<Vec<VideoFormat>> {
        let records = sqlx::query_scalar::<_, String>("SELECT record FROM formats ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        decode_all(records)
    }

    async fn delete_format(&self, id: &FormatId) -> CatalogResult<Option<VideoFormat>> {
        let record =
            sqlx::query_scalar::<_, String>("DELETE FROM formats WHERE id = ? RETURNING record")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        decode(record)
    }

    async fn upsert_frame(&self, frame: VideoFrame) -> CatalogResult<Option<VideoFrame>> {
        let index = i64::try_from(frame.index).map_err(|_| CatalogError::FrameIndex(frame.index))?;
        let format_id = format_key(frame.format_id.as_ref());
        let record = encode(&frame)?;

        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query_scalar::<_, String>(
            "SELECT record FROM frames WHERE source_file_id = ? AND format_id = ? AND frame_index = ?",
        )
        .bind(frame.source_file_id.as_str())
        .bind(format_id)
        .bind(index)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO frames (source_file_id, format_id, frame_index, file_id, record) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (source_file_id, format_id, frame_index) \
             DO UPDATE SET file_id = excluded.file_id, record = excluded.record",
        )
        .bind(frame.source_file_id.as_str())
        .bind(format_id)
        .bind(index)
        .bind(frame.file_id.as_str())
        .bind(record)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        decode(previous)
    }

    async fn find_frame(
        &self,
        source: &FileId,
        format_id: Option<&FormatId>,
        index: u64,
    ) -> CatalogResult<Option<VideoFrame>> {
        let Ok(index) = i64::try_from(index) else {
            return Ok(None);
        };
        let record = sqlx::query_scalar::<_, String>(
            "SELECT record FROM frames WHERE source_file_id = ? AND format_id = ? AND frame_index = ?",
        )
        .bind(source.as_str())
        .bind(format_key(format_id))
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;
        decode(record)
    }

    async fn find_frame_by_file(&self, file_id: &FileId) -> CatalogResult<Option<VideoFrame>> {
        let record =
            sqlx::query_scalar::<_, String>("SELECT record FROM frames WHERE file_id = ? LIMIT 1")
                .bind(file_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        decode(record)
    }

    async fn delete_frame(
        &self,
        source: &FileId,
        format_id: Option<&FormatId>,
        index: u64,
    ) -> CatalogResult<Option<VideoFrame>> {
        let Ok(index) = i64::try_from(index) else {
            return Ok(None);
        };
        let record = sqlx::query_scalar::<_, String>(
            "DELETE FROM frames WHERE source_file_id = ? AND format_id = ? AND frame_index = ? \
             RETURNING record",
        )
        .bind(source.as_str())
        .bind(format_key(format_id))
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;
        decode(record)
    }

    async fn frames_in(&self, scope: &CleanupScope) -> CatalogResult<Vec<VideoFrame>> {
        decode_all(
            self.records_in("frames", "source_file_id, format_id, frame_index", scope)
                .await?,
        )
    }

    async fn put_job(&self, job: VideoJob) -> CatalogResult<Option<VideoJob>> {
        let format_id = format_key(job.format_id.as_ref());
        let record = encode(&job)?;

        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query_scalar::<_, String>(
            "SELECT record FROM jobs WHERE kind = ? AND source_file_id = ? AND format_id = ?",
        )
        .bind(job.kind.as_str())
        .bind(job.source_file_id.as_str())
        .bind(format_id)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO jobs (kind, source_file_id, format_id, job_id, record) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (kind, source_file_id, format_id) \
             DO UPDATE SET job_id = excluded.job_id, record = excluded.record",
        )
        .bind(job.kind.as_str())
        .bind(job.source_file_id.as_str())
        .bind(format_id)
        .bind(job.job_id.as_str())
        .bind(record)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        decode(previous)
    }

    async fn find_job(&self, key: &DedupKey) -> CatalogResult<Option<VideoJob>> {
        let record = sqlx::query_scalar::<_, String>(
            "SELECT record FROM jobs WHERE kind = ? AND source_file_id = ? AND format_id = ?",
        )
        .bind(key.kind.as_str())
        .bind(key.source_file_id.as_str())
        .bind(format_key(key.format_id.as_ref()))
        .fetch_optional(&self.pool)
        .await?;
        decode(record)
    }

    async fn delete_job(&self, key: &DedupKey) -> CatalogResult<Option<VideoJob>> {
        let record = sqlx::query_scalar::<_, String>(
            "DELETE FROM jobs WHERE kind = ? AND source_file_id = ? AND format_id = ? \
             RETURNING record",
        )
        .bind(key.kind.as_str())
        .bind(key.source_file_id.as_str())
        .bind(format_key(key.format_id.as_ref()))
        .fetch_optional(&self.pool)
        .await?;
        decode(record)
    }

    async fn jobs_in(&self, scope: &CleanupScope) -> CatalogResult<Vec<VideoJob>> {
        decode_all(
            self.records_in("jobs", "kind, source_file_id, format_id", scope)
                .await?,
        )
    }
}
