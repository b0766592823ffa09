use super::{StoreError, TelemetryStore, TimeBounds};
use crate::telemetry::{RecordKey, Scope, TelemetryRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;

/// Rows per INSERT statement; keeps bind parameters under the protocol limit.
const UPSERT_CHUNK: usize = 1_000;

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgTelemetryStore {
    pool: PgPool,
}

impl PgTelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let store = Self::new(build_pool(database_url, max_connections).await?);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry (
                time timestamptz NOT NULL,
                device_id text NOT NULL,
                energy_kwh double precision NOT NULL,
                power_kw double precision NOT NULL,
                PRIMARY KEY (time, device_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS telemetry_device_time_idx ON telemetry (device_id, time DESC)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_record(row: &PgRow) -> Result<TelemetryRecord, StoreError> {
    Ok(TelemetryRecord {
        time: row.try_get::<DateTime<Utc>, _>("time")?,
        device_id: row.try_get::<String, _>("device_id")?,
        energy_kwh: row.try_get::<f64, _>("energy_kwh")?,
        power_kw: row.try_get::<f64, _>("power_kw")?,
    })
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn query_records(
        &self,
        scope: &Scope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT time, device_id, energy_kwh, power_kw
            FROM telemetry
            WHERE time >= $1 AND time < $2
              AND ($3::text IS NULL OR device_id = $3)
            ORDER BY time ASC, device_id ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(scope.device_id())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn latest_records(
        &self,
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT time, device_id, energy_kwh, power_kw
            FROM telemetry
            WHERE ($1::text IS NULL OR device_id = $1)
            ORDER BY time DESC, device_id DESC
            LIMIT $2
            "#,
        )
        .bind(scope.device_id())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn find_record(&self, key: &RecordKey) -> Result<Option<TelemetryRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT time, device_id, energy_kwh, power_kw
            FROM telemetry
            WHERE time = $1 AND device_id = $2
            "#,
        )
        .bind(key.time)
        .bind(&key.device_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn time_bounds(&self, scope: &Scope) -> Result<Option<TimeBounds>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT min(time) AS earliest, max(time) AS latest
            FROM telemetry
            WHERE ($1::text IS NULL OR device_id = $1)
            "#,
        )
        .bind(scope.device_id())
        .fetch_one(&self.pool)
        .await?;
        let earliest = row.try_get::<Option<DateTime<Utc>>, _>("earliest")?;
        let latest = row.try_get::<Option<DateTime<Utc>>, _>("latest")?;
        Ok(earliest
            .zip(latest)
            .map(|(earliest, latest)| TimeBounds { earliest, latest }))
    }

    async fn list_devices(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT device_id FROM telemetry ORDER BY device_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("device_id").map_err(StoreError::from))
            .collect()
    }

    async fn upsert_records(&self, records: &[TelemetryRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        // A single statement may not touch the same key twice.
        let mut latest: BTreeMap<RecordKey, &TelemetryRecord> = BTreeMap::new();
        for record in records {
            latest.insert(record.key(), record);
        }
        let unique: Vec<&TelemetryRecord> = latest.into_values().collect();

        let mut written = 0u64;
        for chunk in unique.chunks(UPSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO telemetry (time, device_id, energy_kwh, power_kw) ");
            builder.push_values(chunk.iter(), |mut b, record| {
                b.push_bind(record.time)
                    .push_bind(&record.device_id)
                    .push_bind(record.energy_kwh)
                    .push_bind(record.power_kw);
            });
            builder.push(
                " ON CONFLICT (time, device_id) DO UPDATE SET \
                 energy_kwh = EXCLUDED.energy_kwh, power_kw = EXCLUDED.power_kw",
            );
            let result = builder.build().execute(&self.pool).await?;
            written += result.rows_affected();
        }
        Ok(written)
    }
}
