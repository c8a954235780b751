//! Diesel-based model catalog repository for SQLite.
//!
//! The `(source, source_model_id)` uniqueness invariant is enforced by a
//! unique index, so `insert` cannot be raced into a duplicate even by
//! concurrent writers. All reads see either a fully written record or none.

use std::collections::HashMap;
use std::path::Path;

use diesel::prelude::*;

use super::diesel_pool::{run_blocking, SqlitePool};
use super::parse_datetime;
use crate::error::StoreError;
use crate::models::{ModelRecord, SourceId};
use crate::schema::models;

/// Database row for a cataloged model.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = models)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct ModelRow {
    id: i32,
    source: String,
    source_model_id: String,
    name: String,
    artist: Option<String>,
    source_url: String,
    license_type: Option<String>,
    license_url: Option<String>,
    acquired_at: String,
    file_path: String,
    file_type: String,
    original_format: Option<String>,
    size_bytes: i64,
    thumbnail_path: Option<String>,
    notes: String,
}

/// New model row for insertion. Owned fields so the value can cross into
/// `spawn_blocking`.
#[derive(Insertable, Debug)]
#[diesel(table_name = models)]
struct NewModelRow {
    source: String,
    source_model_id: String,
    name: String,
    artist: Option<String>,
    source_url: String,
    license_type: Option<String>,
    license_url: Option<String>,
    acquired_at: String,
    file_path: String,
    file_type: String,
    original_format: Option<String>,
    size_bytes: i64,
    thumbnail_path: Option<String>,
    notes: String,
}

impl From<&ModelRecord> for NewModelRow {
    fn from(record: &ModelRecord) -> Self {
        NewModelRow {
            source: record.source.as_str().to_string(),
            source_model_id: record.source_model_id.clone(),
            name: record.name.clone(),
            artist: record.artist.clone(),
            source_url: record.source_url.clone(),
            license_type: record.license_type.clone(),
            license_url: record.license_url.clone(),
            acquired_at: record.acquired_at.to_rfc3339(),
            file_path: record.file_path.clone(),
            file_type: record.file_type.clone(),
            original_format: record.original_format.clone(),
            size_bytes: record.size_bytes as i64,
            thumbnail_path: record.thumbnail_path.clone(),
            notes: serde_json::to_string(&record.notes).unwrap_or_else(|_| "[]".to_string()),
        }
    }
}

impl From<ModelRow> for ModelRecord {
    fn from(row: ModelRow) -> Self {
        ModelRecord {
            source: SourceId::from_str(&row.source).unwrap_or(SourceId::GitHub),
            source_model_id: row.source_model_id,
            name: row.name,
            artist: row.artist,
            source_url: row.source_url,
            license_type: row.license_type,
            license_url: row.license_url,
            acquired_at: parse_datetime(&row.acquired_at),
            file_path: row.file_path,
            file_type: row.file_type,
            original_format: row.original_format,
            size_bytes: row.size_bytes.max(0) as u64,
            thumbnail_path: row.thumbnail_path,
            notes: serde_json::from_str(&row.notes).unwrap_or_default(),
        }
    }
}

#[derive(QueryableByName)]
struct SourceCount {
    #[diesel(sql_type = diesel::sql_types::Text)]
    source: String,
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    count: i64,
}

/// Model catalog repository with compile-time query checking.
#[derive(Clone)]
pub struct ModelRepository {
    pool: SqlitePool,
}

impl ModelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the catalog table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        run_blocking(pool, |conn| {
            diesel::sql_query(
                r#"CREATE TABLE IF NOT EXISTS models (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source TEXT NOT NULL,
                    source_model_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    artist TEXT,
                    source_url TEXT NOT NULL,
                    license_type TEXT,
                    license_url TEXT,
                    acquired_at TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    file_type TEXT NOT NULL,
                    original_format TEXT,
                    size_bytes BIGINT NOT NULL,
                    thumbnail_path TEXT,
                    notes TEXT NOT NULL DEFAULT '[]'
                )"#,
            )
            .execute(conn)?;
            diesel::sql_query(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_models_source_model
                 ON models(source, source_model_id)",
            )
            .execute(conn)?;
            diesel::sql_query(
                "CREATE INDEX IF NOT EXISTS idx_models_acquired_at ON models(acquired_at)",
            )
            .execute(conn)?;
            diesel::sql_query(
                "CREATE INDEX IF NOT EXISTS idx_models_file_type ON models(file_type)",
            )
            .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Check whether a `(source, source_model_id)` pair is already cataloged.
    pub async fn exists(
        &self,
        source: SourceId,
        source_model_id: &str,
    ) -> Result<bool, StoreError> {
        let source = source.as_str().to_string();
        let model_id = source_model_id.to_string();
        let pool = self.pool.clone();

        let count = run_blocking(pool, move |conn| {
            use diesel::dsl::count_star;
            let count: i64 = models::table
                .filter(models::source.eq(&source))
                .filter(models::source_model_id.eq(&model_id))
                .select(count_star())
                .first(conn)?;
            Ok(count)
        })
        .await?;
        Ok(count > 0)
    }

    /// Insert one record. Never overwrites: a key collision surfaces as
    /// `StoreError::DuplicateKey`.
    pub async fn insert(&self, record: &ModelRecord) -> Result<(), StoreError> {
        let row = NewModelRow::from(record);
        let source = record.source.as_str().to_string();
        let source_model_id = record.source_model_id.clone();
        let pool = self.pool.clone();

        let result = run_blocking(pool, move |conn| {
            diesel::insert_into(models::table).values(row).execute(conn)
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            )) => Err(StoreError::DuplicateKey {
                source_name: source,
                source_model_id,
            }),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Query records, newest-acquired-first, optionally filtered by source.
    pub async fn query(
        &self,
        source: Option<SourceId>,
        limit: Option<i64>,
    ) -> Result<Vec<ModelRecord>, StoreError> {
        let source = source.map(|s| s.as_str().to_string());
        let pool = self.pool.clone();

        let rows = run_blocking(pool, move |conn| {
            let mut query = models::table
                .order((models::acquired_at.desc(), models::id.desc()))
                .into_boxed();
            if let Some(source) = source {
                query = query.filter(models::source.eq(source));
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            query.load::<ModelRow>(conn)
        })
        .await?;

        Ok(rows.into_iter().map(ModelRecord::from).collect())
    }

    /// Full ordered catalog dump.
    pub async fn export(&self) -> Result<Vec<ModelRecord>, StoreError> {
        self.query(None, None).await
    }

    /// Merge records in: duplicates by dedup key are skipped, never
    /// overwritten. Returns the number actually inserted.
    pub async fn import(&self, records: Vec<ModelRecord>) -> Result<usize, StoreError> {
        let mut inserted = 0;
        for record in &records {
            match self.insert(record).await {
                Ok(()) => inserted += 1,
                Err(StoreError::DuplicateKey { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(inserted)
    }

    /// Write the full catalog to a JSON file (one array of records).
    pub async fn export_json(&self, path: &Path) -> anyhow::Result<usize> {
        let records = self.export().await?;
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(path, json)?;
        Ok(records.len())
    }

    /// Read a JSON export and merge it in. Returns the number inserted.
    pub async fn import_json(&self, path: &Path) -> anyhow::Result<usize> {
        let raw = std::fs::read_to_string(path)?;
        let records: Vec<ModelRecord> = serde_json::from_str(&raw)?;
        Ok(self.import(records).await?)
    }

    /// Total cataloged records.
    pub async fn count(&self) -> Result<u64, StoreError> {
        let pool = self.pool.clone();
        let count = run_blocking(pool, |conn| {
            use diesel::dsl::count_star;
            let count: i64 = models::table.select(count_star()).first(conn)?;
            Ok(count)
        })
        .await?;
        Ok(count as u64)
    }

    /// Record counts per source, for stats output.
    pub async fn count_by_source(&self) -> Result<HashMap<String, u64>, StoreError> {
        let pool = self.pool.clone();
        let rows: Vec<SourceCount> = run_blocking(pool, |conn| {
            diesel::sql_query("SELECT source, COUNT(*) as count FROM models GROUP BY source")
                .load(conn)
        })
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.source, row.count as u64))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::diesel_pool::create_pool;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    async fn setup() -> (ModelRepository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        let repo = ModelRepository::new(pool);
        repo.ensure_schema().await.unwrap();
        (repo, dir)
    }

    fn record(source: SourceId, id: &str) -> ModelRecord {
        ModelRecord {
            source,
            source_model_id: id.to_string(),
            name: format!("Model {id}"),
            artist: Some("tester".into()),
            source_url: format!("https://example.com/{id}"),
            license_type: Some("CC0".into()),
            license_url: None,
            acquired_at: Utc::now(),
            file_path: format!("raw/{}/{id}.vrm", source.as_str()),
            file_type: "vrm".into(),
            original_format: None,
            size_bytes: 42,
            thumbnail_path: None,
            notes: vec!["sha256:00".into()],
        }
    }

    #[tokio::test]
    async fn test_insert_exists_and_duplicate() {
        let (repo, _dir) = setup().await;

        assert!(!repo.exists(SourceId::VroidHub, "m1").await.unwrap());
        repo.insert(&record(SourceId::VroidHub, "m1")).await.unwrap();
        assert!(repo.exists(SourceId::VroidHub, "m1").await.unwrap());

        // Same id under a different source is a different key
        assert!(!repo.exists(SourceId::Sketchfab, "m1").await.unwrap());

        let err = repo
            .insert(&record(SourceId::VroidHub, "m1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_orders_newest_first() {
        let (repo, _dir) = setup().await;

        let base = Utc::now();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let mut rec = record(SourceId::Sketchfab, id);
            rec.acquired_at = base + Duration::seconds(i as i64);
            repo.insert(&rec).await.unwrap();
        }

        let all = repo.query(None, None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.source_model_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let limited = repo.query(None, Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_query_filters_by_source() {
        let (repo, _dir) = setup().await;
        repo.insert(&record(SourceId::VroidHub, "v1")).await.unwrap();
        repo.insert(&record(SourceId::GitHub, "g1")).await.unwrap();

        let vroid = repo.query(Some(SourceId::VroidHub), None).await.unwrap();
        assert_eq!(vroid.len(), 1);
        assert_eq!(vroid[0].source, SourceId::VroidHub);
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let (repo, _dir) = setup().await;
        repo.insert(&record(SourceId::VroidHub, "v1")).await.unwrap();
        repo.insert(&record(SourceId::DeviantArt, "d1")).await.unwrap();

        let exported = repo.export().await.unwrap();
        assert_eq!(exported.len(), 2);

        // Uniqueness holds in the export
        let mut keys: Vec<(SourceId, String)> = exported
            .iter()
            .map(|r| (r.source, r.source_model_id.clone()))
            .collect();
        keys.sort_by(|a, b| (a.0.as_str(), &a.1).cmp(&(b.0.as_str(), &b.1)));
        keys.dedup();
        assert_eq!(keys.len(), 2);

        let (fresh, _dir2) = setup().await;
        let inserted = fresh.import(exported.clone()).await.unwrap();
        assert_eq!(inserted, 2);

        let mut round_tripped = fresh.export().await.unwrap();
        let mut original = exported;
        round_tripped.sort_by(|a, b| a.source_model_id.cmp(&b.source_model_id));
        original.sort_by(|a, b| a.source_model_id.cmp(&b.source_model_id));
        assert_eq!(round_tripped, original);
    }

    #[tokio::test]
    async fn test_import_skips_existing() {
        let (repo, _dir) = setup().await;
        repo.insert(&record(SourceId::Sketchfab, "s1")).await.unwrap();

        let inserted = repo
            .import(vec![
                record(SourceId::Sketchfab, "s1"),
                record(SourceId::Sketchfab, "s2"),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_export_import_json_files() {
        let (repo, dir) = setup().await;
        repo.insert(&record(SourceId::GitHub, "g1")).await.unwrap();

        let path = dir.path().join("export.json");
        let written = repo.export_json(&path).await.unwrap();
        assert_eq!(written, 1);

        let (fresh, _dir2) = setup().await;
        let imported = fresh.import_json(&path).await.unwrap();
        assert_eq!(imported, 1);
        assert!(fresh.exists(SourceId::GitHub, "g1").await.unwrap());
    }

    #[tokio::test]
    async fn test_count_by_source() {
        let (repo, _dir) = setup().await;
        repo.insert(&record(SourceId::VroidHub, "a")).await.unwrap();
        repo.insert(&record(SourceId::VroidHub, "b")).await.unwrap();
        repo.insert(&record(SourceId::GitHub, "c")).await.unwrap();

        let counts = repo.count_by_source().await.unwrap();
        assert_eq!(counts.get("vroid_hub"), Some(&2));
        assert_eq!(counts.get("github"), Some(&1));
    }
}
