use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::DocumentStore;
use crate::config::StorageConfig;
use crate::document::{Document, DocumentConfig, Line, LineId, Person};
use crate::error::{Result, SyncError};
use crate::telemetry::logging::redact_url;

/// PostgreSQL-backed store.
///
/// Layout: a single `config` row (id 1), `lines` each owning rows in
/// `people`, and a flat `wait_queue`. Ordering is kept in `position` columns.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    /// Create a connection pool from storage configuration.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let url = config.database_url().ok_or_else(|| {
            SyncError::configuration(
                "storage.url (or DATABASE_URL) is required for the postgres backend",
            )
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&url)
            .await?;

        info!(
            url = %redact_url(&url),
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SyncError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Load
    // ═══════════════════════════════════════════════════════════════════════════

    async fn load_config(&self) -> Result<DocumentConfig> {
        let row = sqlx::query(
            r#"
            SELECT session_duration, alarm_interval, max_people_per_line, blink_before_start,
                   blink_time, finish_window, auto_reschedule
            FROM config
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            // First access: create the singleton with defaults.
            let config = DocumentConfig::default();
            let mut tx = self.pool.begin().await?;
            upsert_config(&mut tx, &config).await?;
            tx.commit().await?;
            debug!("Config row created with defaults");
            return Ok(config);
        };

        let mut config = DocumentConfig {
            session_duration: row.try_get("session_duration")?,
            alarm_interval: row.try_get("alarm_interval")?,
            max_people_per_line: row.try_get("max_people_per_line")?,
            blink_before_start: row.try_get("blink_before_start")?,
            blink_time: row.try_get("blink_time")?,
            finish_window: row.try_get("finish_window")?,
            auto_reschedule: row.try_get("auto_reschedule")?,
        };

        let stored = config.max_people_per_line.clone();
        config.normalize();
        if stored != config.max_people_per_line {
            warn!(stored = %stored, "Stored maxPeoplePerLine is invalid, using default");
        }

        Ok(config)
    }

    async fn load_lines(&self) -> Result<Vec<Line>> {
        let line_rows = sqlx::query("SELECT id, name, time FROM lines ORDER BY position, id")
            .fetch_all(&self.pool)
            .await?;

        let mut lines = Vec::with_capacity(line_rows.len());
        let mut index: HashMap<LineId, usize> = HashMap::new();
        for row in line_rows {
            let id: i64 = row.try_get("id")?;
            index.insert(id, lines.len());
            lines.push(Line {
                id,
                name: row.try_get("name")?,
                time: row.try_get("time")?,
                people: Vec::new(),
            });
        }

        let people_rows = sqlx::query(
            "SELECT id, line_id, name, created_at FROM people ORDER BY position, id",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in people_rows {
            let line_id: i64 = row.try_get("line_id")?;
            let person = person_from_row(&row)?;
            match index.get(&line_id) {
                Some(&i) => lines[i].people.push(person),
                None => warn!(person_id = person.id, line_id, "Skipping person of unknown line"),
            }
        }

        Ok(lines)
    }

    async fn load_wait_queue(&self) -> Result<Vec<Person>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM wait_queue ORDER BY position, id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(person_from_row).collect()
    }
}

fn person_from_row(row: &sqlx::postgres::PgRow) -> Result<Person> {
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    Ok(Person {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replace
// ═══════════════════════════════════════════════════════════════════════════════

async fn upsert_config(tx: &mut Transaction<'_, Postgres>, config: &DocumentConfig) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO config (id, session_duration, alarm_interval, max_people_per_line,
                            blink_before_start, blink_time, finish_window, auto_reschedule)
        VALUES (1, $1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE SET
            session_duration = EXCLUDED.session_duration,
            alarm_interval = EXCLUDED.alarm_interval,
            max_people_per_line = EXCLUDED.max_people_per_line,
            blink_before_start = EXCLUDED.blink_before_start,
            blink_time = EXCLUDED.blink_time,
            finish_window = EXCLUDED.finish_window,
            auto_reschedule = EXCLUDED.auto_reschedule
        "#,
    )
    .bind(&config.session_duration)
    .bind(&config.alarm_interval)
    .bind(&config.max_people_per_line)
    .bind(config.blink_before_start)
    .bind(&config.blink_time)
    .bind(&config.finish_window)
    .bind(&config.auto_reschedule)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn replace_lines(tx: &mut Transaction<'_, Postgres>, lines: &[Line]) -> Result<()> {
    let line_ids: Vec<i64> = lines.iter().map(|l| l.id).collect();
    let person_ids: Vec<i64> = lines
        .iter()
        .flat_map(|l| l.people.iter().map(|p| p.id))
        .collect();

    // People of removed lines go first, then the lines themselves.
    let removed_people = sqlx::query(
        "DELETE FROM people WHERE NOT (id = ANY($1)) OR NOT (line_id = ANY($2))",
    )
    .bind(&person_ids)
    .bind(&line_ids)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    let removed_lines = sqlx::query("DELETE FROM lines WHERE NOT (id = ANY($1))")
        .bind(&line_ids)
        .execute(&mut **tx)
        .await?
        .rows_affected();

    for (position, line) in lines.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO lines (id, name, time, position)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                time = EXCLUDED.time,
                position = EXCLUDED.position
            "#,
        )
        .bind(line.id)
        .bind(&line.name)
        .bind(&line.time)
        .bind(position as i32)
        .execute(&mut **tx)
        .await?;
    }

    for line in lines {
        for (position, person) in line.people.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO people (id, line_id, name, created_at, position)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE SET
                    line_id = EXCLUDED.line_id,
                    name = EXCLUDED.name,
                    created_at = EXCLUDED.created_at,
                    position = EXCLUDED.position
                "#,
            )
            .bind(person.id)
            .bind(line.id)
            .bind(&person.name)
            .bind(person.created_at)
            .bind(position as i32)
            .execute(&mut **tx)
            .await?;
        }
    }

    debug!(removed_people, removed_lines, lines = lines.len(), "Lines replaced");
    Ok(())
}

async fn replace_wait_queue(tx: &mut Transaction<'_, Postgres>, queue: &[Person]) -> Result<()> {
    let ids: Vec<i64> = queue.iter().map(|p| p.id).collect();

    sqlx::query("DELETE FROM wait_queue WHERE NOT (id = ANY($1))")
        .bind(&ids)
        .execute(&mut **tx)
        .await?;

    for (position, person) in queue.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO wait_queue (id, name, created_at, position)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                created_at = EXCLUDED.created_at,
                position = EXCLUDED.position
            "#,
        )
        .bind(person.id)
        .bind(&person.name)
        .bind(person.created_at)
        .bind(position as i32)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn load(&self) -> Result<Document> {
        let config = self.load_config().await?;
        let lines = self.load_lines().await?;
        let general_wait_queue = self.load_wait_queue().await?;

        Ok(Document {
            config,
            lines,
            general_wait_queue,
        })
    }

    async fn replace(&self, document: &Document) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        upsert_config(&mut tx, &document.config).await?;
        replace_lines(&mut tx, &document.lines).await?;
        replace_wait_queue(&mut tx, &document.general_wait_queue).await?;

        tx.commit().await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
