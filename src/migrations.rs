//! Migration running over plain SQL file pairs.
//!
//! Migrations live in one directory as `{version}_{description}.up.sql` /
//! `.down.sql` pairs, where `version` is a numeric timestamp. The runner
//! keeps its own append-only history table (`_relstore_migrations`) and
//! applies each migration inside its own transaction, so a failing script
//! leaves the database at the last fully-applied version.
//!
//! There is no schema diffing: [`MigrationRunner::generate`] writes a
//! skeleton, optionally pre-filled with the DDL of the declared schema, and
//! the author takes it from there.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::pool::PoolManager;
use crate::schema::SchemaRegistry;
use crate::session::Session;

const HISTORY_TABLE: &str = "_relstore_migrations";

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";

/// One applied migration, as recorded in the history table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MigrationRecord {
    pub version: i64,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

/// A migration pair loaded from disk.
#[derive(Debug, Clone)]
struct MigrationFile {
    version: i64,
    description: String,
    up_sql: String,
    down_sql: Option<String>,
}

/// Applies, reverts and scaffolds SQL migrations for one directory.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    dir: PathBuf,
}

impl MigrationRunner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory the runner reads migrations from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Apply pending migrations, oldest first, stopping at `target` when
    /// given (inclusive) or at the newest available otherwise.
    ///
    /// Each migration runs in its own transaction together with its history
    /// row. A `target` below the current head is rejected; downgrades go
    /// through [`rollback`](Self::rollback).
    pub async fn apply(
        &self,
        manager: &PoolManager,
        target: Option<i64>,
    ) -> StoreResult<Vec<MigrationRecord>> {
        let files = self.load()?;
        let mut session = manager.open_session().await?;

        let result = async {
            ensure_history_table(&mut session).await?;
            let applied = history_rows(&mut session).await?;
            let head = applied.last().map(|r| r.version).unwrap_or(0);

            if let Some(target) = target {
                if target < head {
                    return Err(StoreError::store(
                        "apply",
                        "migration",
                        None,
                        format!(
                            "target version {target} is below the current head {head}; \
                             use rollback to downgrade"
                        ),
                    ));
                }
            }

            let mut records = Vec::new();
            for file in &files {
                if applied.iter().any(|r| r.version == file.version) {
                    continue;
                }
                if let Some(target) = target {
                    if file.version > target {
                        break;
                    }
                }

                info!(
                    version = file.version,
                    description = %file.description,
                    "Applying migration"
                );
                let record = apply_one(&mut session, file).await?;
                records.push(record);
            }

            if records.is_empty() {
                debug!("No pending migrations");
            }
            Ok(records)
        }
        .await;

        session.close().await;
        result
    }

    /// Revert the most recent `steps` applied migrations, newest first.
    ///
    /// Each down-script runs in its own transaction together with the
    /// deletion of its history row. A migration without a down file stops
    /// the rollback before touching anything.
    pub async fn rollback(
        &self,
        manager: &PoolManager,
        steps: usize,
    ) -> StoreResult<Vec<MigrationRecord>> {
        let files = self.load()?;
        let mut session = manager.open_session().await?;

        let result = async {
            ensure_history_table(&mut session).await?;
            let applied = history_rows(&mut session).await?;

            let mut reverted = Vec::new();
            for record in applied.iter().rev().take(steps) {
                let file = files.iter().find(|f| f.version == record.version).ok_or_else(|| {
                    StoreError::store(
                        "rollback",
                        "migration",
                        None,
                        format!("no migration file found for applied version {}", record.version),
                    )
                })?;
                let down_sql = file.down_sql.as_deref().ok_or_else(|| {
                    StoreError::store(
                        "rollback",
                        "migration",
                        None,
                        format!("migration {} has no down script", file.version),
                    )
                })?;

                warn!(
                    version = file.version,
                    description = %file.description,
                    "Reverting migration"
                );
                revert_one(&mut session, file.version, down_sql).await?;
                reverted.push(record.clone());
            }
            Ok(reverted)
        }
        .await;

        session.close().await;
        result
    }

    /// Applied migrations in application order.
    pub async fn history(&self, manager: &PoolManager) -> StoreResult<Vec<MigrationRecord>> {
        let mut session = manager.open_session().await?;
        let result = async {
            ensure_history_table(&mut session).await?;
            history_rows(&mut session).await
        }
        .await;
        session.close().await;
        result
    }

    /// Write a new up/down migration pair and return their paths.
    ///
    /// With `include_schema` and a registry, the up file is pre-filled with
    /// `CREATE TABLE` DDL for every declared table and the down file with the
    /// matching drops. Otherwise both are empty skeletons.
    pub fn generate(
        &self,
        message: &str,
        include_schema: bool,
        registry: Option<&SchemaRegistry>,
    ) -> StoreResult<(PathBuf, PathBuf)> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            StoreError::configuration(format!(
                "cannot create migration directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let version = Utc::now().format("%Y%m%d%H%M%S");
        let slug = slugify(message);
        let up_path = self.dir.join(format!("{version}_{slug}{UP_SUFFIX}"));
        let down_path = self.dir.join(format!("{version}_{slug}{DOWN_SUFFIX}"));

        let mut up = format!("-- {message}\n");
        let mut down = format!("-- revert: {message}\n");
        match registry {
            Some(registry) if include_schema => {
                up.push('\n');
                up.push_str(&registry.ddl());
                up.push('\n');
                down.push('\n');
                // Drop in reverse registration order so dependents go first.
                for table in registry.tables().iter().rev() {
                    down.push_str(&table.drop_sql());
                    down.push('\n');
                }
            }
            _ => {}
        }

        write_file(&up_path, &up)?;
        write_file(&down_path, &down)?;

        info!(up = %up_path.display(), down = %down_path.display(), "Generated migration pair");
        Ok((up_path, down_path))
    }

    /// Load and sort the migration files on disk.
    fn load(&self) -> StoreResult<Vec<MigrationFile>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            StoreError::configuration(format!(
                "cannot read migration directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                StoreError::configuration(format!("cannot read migration directory entry: {e}"))
            })?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(UP_SUFFIX) else {
                continue;
            };

            let (version, description) = parse_stem(&path, stem)?;
            let up_sql = read_file(&path)?;
            let down_path = self.dir.join(format!("{stem}{DOWN_SUFFIX}"));
            let down_sql = if down_path.exists() {
                Some(read_file(&down_path)?)
            } else {
                None
            };

            files.push(MigrationFile {
                version,
                description,
                up_sql,
                down_sql,
            });
        }

        files.sort_by_key(|f| f.version);
        for pair in files.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(StoreError::configuration(format!(
                    "duplicate migration version {} in {}",
                    pair[0].version,
                    self.dir.display()
                )));
            }
        }
        Ok(files)
    }
}

fn parse_stem(path: &Path, stem: &str) -> StoreResult<(i64, String)> {
    let (version, description) = stem.split_once('_').ok_or_else(|| {
        StoreError::configuration(format!(
            "migration file name {} is not '<version>_<description>.up.sql'",
            path.display()
        ))
    })?;
    let version: i64 = version.parse().map_err(|_| {
        StoreError::configuration(format!(
            "migration file {} has a non-numeric version",
            path.display()
        ))
    })?;
    Ok((version, description.to_string()))
}

fn slugify(message: &str) -> String {
    let mut slug = String::with_capacity(message.len());
    for c in message.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

fn read_file(path: &Path) -> StoreResult<String> {
    fs::read_to_string(path).map_err(|e| {
        StoreError::configuration(format!("cannot read migration file {}: {e}", path.display()))
    })
}

fn write_file(path: &Path, contents: &str) -> StoreResult<()> {
    fs::write(path, contents).map_err(|e| {
        StoreError::configuration(format!(
            "cannot write migration file {}: {e}",
            path.display()
        ))
    })
}

async fn ensure_history_table(session: &mut Session) -> StoreResult<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (\n    \
         version INTEGER PRIMARY KEY,\n    \
         description TEXT NOT NULL,\n    \
         applied_at TEXT NOT NULL\n)"
    );
    session.trace_sql(&sql);
    let conn = session.conn()?;
    sqlx::query(&sql)
        .execute(conn)
        .await
        .map_err(|e| StoreError::from_driver("ensure_history", "migration", None, e))?;
    Ok(())
}

async fn history_rows(
    session: &mut Session,
) -> StoreResult<Vec<MigrationRecord>> {
    let sql = format!(
        "SELECT version, description, applied_at FROM {HISTORY_TABLE} ORDER BY version"
    );
    session.trace_sql(&sql);
    let conn = session.conn()?;
    sqlx::query_as::<_, MigrationRecord>(&sql)
        .fetch_all(conn)
        .await
        .map_err(|e| StoreError::from_driver("history", "migration", None, e))
}

async fn apply_one(
    session: &mut Session,
    file: &MigrationFile,
) -> StoreResult<MigrationRecord> {
    let scope = session.begin().await?;
    let result = async {
        let conn = session.conn()?;
        sqlx::raw_sql(&file.up_sql)
            .execute(conn)
            .await
            .map_err(|e| StoreError::from_driver("apply", "migration", None, e))?;

        let applied_at = Utc::now();
        let sql = format!(
            "INSERT INTO {HISTORY_TABLE} (version, description, applied_at) VALUES (?, ?, ?)"
        );
        let conn = session.conn()?;
        sqlx::query(&sql)
            .bind(file.version)
            .bind(&file.description)
            .bind(applied_at)
            .execute(conn)
            .await
            .map_err(|e| StoreError::from_driver("apply", "migration", None, e))?;

        Ok(MigrationRecord {
            version: file.version,
            description: file.description.clone(),
            applied_at,
        })
    }
    .await;

    match result {
        Ok(record) => {
            session.commit(scope).await?;
            Ok(record)
        }
        Err(err) => {
            session.abort_scope(scope).await;
            Err(err)
        }
    }
}

async fn revert_one(
    session: &mut Session,
    version: i64,
    down_sql: &str,
) -> StoreResult<()> {
    let scope = session.begin().await?;
    let result = async {
        let conn = session.conn()?;
        sqlx::raw_sql(down_sql)
            .execute(conn)
            .await
            .map_err(|e| StoreError::from_driver("rollback", "migration", None, e))?;

        let sql = format!("DELETE FROM {HISTORY_TABLE} WHERE version = ?");
        let conn = session.conn()?;
        sqlx::query(&sql)
            .bind(version)
            .execute(conn)
            .await
            .map_err(|e| StoreError::from_driver("rollback", "migration", None, e))?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => session.commit(scope).await,
        Err(err) => {
            session.abort_scope(scope).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add users table"), "add_users_table");
        assert_eq!(slugify("  weird -- name!! "), "weird_name");
    }

    #[test]
    fn test_parse_stem() {
        let path = Path::new("20260826120000_add_users.up.sql");
        let (version, description) = parse_stem(path, "20260826120000_add_users").unwrap();
        assert_eq!(version, 20260826120000);
        assert_eq!(description, "add_users");
    }

    #[test]
    fn test_parse_stem_rejects_missing_separator() {
        let path = Path::new("nonsense.up.sql");
        assert!(parse_stem(path, "nonsense").is_err());
    }
}
