//! Postgres-backed activity store.

use std::collections::{HashMap, HashSet};

use actsync_core::{ActivityContent, Endpoint, EndpointKind, StoredActivity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, warn};

use crate::store::{ActivityStore, CacheInvalidation, EndpointSource, StoreError};

const ACTIVITY_COLUMNS: &str = "id, level_id, name, type, description, start_date, end_date, \
     rt_type, rt_visibility, location, cover_picture, canceled, latitude, longitude, \
     api_endpoint_id, created_at, updated_at, deleted_at";

// 18 binds per row keeps a chunk well under the 65535 bind parameter limit.
const UPSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgActivityStore {
    pool: PgPool,
}

impl PgActivityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn activity_from_row(row: &PgRow) -> Result<StoredActivity, sqlx::Error> {
    Ok(StoredActivity {
        id: row.try_get("id")?,
        content: ActivityContent {
            level_id: row.try_get("level_id")?,
            name: row.try_get("name")?,
            kind: row.try_get("type")?,
            description: row.try_get("description")?,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            rt_type: row.try_get("rt_type")?,
            rt_visibility: row.try_get("rt_visibility")?,
            location: row.try_get("location")?,
            cover_picture: row.try_get("cover_picture")?,
            canceled: row.try_get("canceled")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            api_endpoint_id: row.try_get("api_endpoint_id")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

#[async_trait]
impl ActivityStore for PgActivityStore {
    async fn find_active(&self, id: i64) -> Result<Option<StoredActivity>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(activity_from_row).transpose()?)
    }

    async fn find_including_retired(&self, id: i64) -> Result<Option<StoredActivity>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(activity_from_row).transpose()?)
    }

    async fn find_many_including_retired(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, StoredActivity>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let activity = activity_from_row(row)?;
            out.insert(activity.id, activity);
        }
        Ok(out)
    }

    async fn upsert_activities(&self, rows: &[StoredActivity]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;
        for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO activities ({ACTIVITY_COLUMNS}) "));
            builder.push_values(chunk, |mut b, row| {
                let c = &row.content;
                b.push_bind(row.id)
                    .push_bind(c.level_id)
                    .push_bind(c.name.clone())
                    .push_bind(c.kind.clone())
                    .push_bind(c.description.clone())
                    .push_bind(c.start_date)
                    .push_bind(c.end_date)
                    .push_bind(c.rt_type.clone())
                    .push_bind(c.rt_visibility.clone())
                    .push_bind(c.location.clone())
                    .push_bind(c.cover_picture.clone())
                    .push_bind(c.canceled)
                    .push_bind(c.latitude)
                    .push_bind(c.longitude)
                    .push_bind(c.api_endpoint_id)
                    .push_bind(row.created_at)
                    .push_bind(row.updated_at)
                    .push_bind(row.deleted_at);
            });
            builder.push(
                r#"
                ON CONFLICT (id) DO UPDATE SET
                    level_id = EXCLUDED.level_id,
                    name = EXCLUDED.name,
                    type = EXCLUDED.type,
                    description = EXCLUDED.description,
                    start_date = EXCLUDED.start_date,
                    end_date = EXCLUDED.end_date,
                    rt_type = EXCLUDED.rt_type,
                    rt_visibility = EXCLUDED.rt_visibility,
                    location = EXCLUDED.location,
                    cover_picture = EXCLUDED.cover_picture,
                    canceled = EXCLUDED.canceled,
                    latitude = EXCLUDED.latitude,
                    longitude = EXCLUDED.longitude,
                    api_endpoint_id = EXCLUDED.api_endpoint_id,
                    updated_at = EXCLUDED.updated_at,
                    deleted_at = EXCLUDED.deleted_at
                "#,
            );
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        debug!(rows = rows.len(), affected, "upserted activities");
        Ok(affected)
    }

    async fn register_endpoints(&self, endpoints: &[Endpoint]) -> Result<u64, StoreError> {
        if endpoints.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO api_endpoints (id, url, token, description, area, type) ",
        );
        builder.push_values(endpoints, |mut b, endpoint| {
            b.push_bind(endpoint.id)
                .push_bind(endpoint.url.clone())
                .push_bind(endpoint.token.clone())
                .push_bind(endpoint.description.clone())
                .push_bind(endpoint.area.clone())
                .push_bind(endpoint.kind.map(|kind| kind.as_str()));
        });
        builder.push(
            r#"
            ON CONFLICT (id) DO UPDATE SET
                url = EXCLUDED.url,
                token = EXCLUDED.token,
                description = EXCLUDED.description,
                area = EXCLUDED.area,
                type = EXCLUDED.type,
                updated_at = NOW()
            WHERE (api_endpoints.url, api_endpoints.token, api_endpoints.description,
                   api_endpoints.area, api_endpoints.type)
                IS DISTINCT FROM
                  (EXCLUDED.url, EXCLUDED.token, EXCLUDED.description,
                   EXCLUDED.area, EXCLUDED.type)
            "#,
        );
        let changed = builder.build().execute(&mut *tx).await?.rows_affected();
        // Explicit ids bypass the serial; keep it ahead of them for rows added by hand.
        sqlx::query(
            "SELECT setval(pg_get_serial_sequence('api_endpoints', 'id'), \
             (SELECT COALESCE(MAX(id), 1) FROM api_endpoints))",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        if changed > 0 {
            debug!(changed, "registered endpoints");
        }
        Ok(changed)
    }

    async fn active_ids_for_endpoint(&self, endpoint_id: i64) -> Result<HashSet<i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM activities WHERE api_endpoint_id = $1 AND deleted_at IS NULL",
        )
        .bind(endpoint_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(StoreError::from))
            .collect()
    }

    async fn soft_delete(&self, ids: &[i64], at: DateTime<Utc>) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE activities SET deleted_at = $1 WHERE id = ANY($2) AND deleted_at IS NULL",
        )
        .bind(at)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EndpointSource for PgActivityStore {
    async fn load_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, token, description, area, type
              FROM api_endpoints
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let kind: Option<String> = row.try_get("type")?;
            let kind = match kind.as_deref() {
                None => None,
                Some(raw) => {
                    let parsed = EndpointKind::parse(raw);
                    if parsed.is_none() {
                        warn!(endpoint_id = id, kind = raw, "unknown endpoint type ignored");
                    }
                    parsed
                }
            };
            out.push(Endpoint {
                id,
                url: row.try_get("url")?,
                token: row
                    .try_get::<Option<String>, _>("token")?
                    .filter(|t| !t.trim().is_empty()),
                description: row
                    .try_get::<Option<String>, _>("description")?
                    .unwrap_or_default(),
                area: row.try_get("area")?,
                kind,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl CacheInvalidation for PgActivityStore {
    async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cache_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
