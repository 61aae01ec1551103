use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sea_orm::sea_query;
use sea_orm::sea_query::{
    Expr, MysqlQueryBuilder, OnConflict, Order, PostgresQueryBuilder, Query,
    QueryStatementWriter, SqliteQueryBuilder, Value as SeaValue,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, QueryResult,
    Statement,
};
use sea_orm_migration::MigratorTrait;

use crate::db::*;
use crate::migration::Migrator;
use crate::PreaggConfig;
use preagg_core::{
    Clock, CreateOutcome, Job, JobId, JobRepository, JobStatus, LivenessProber, PreaggError,
    PreaggResult, TeamId, TimeRange, TransitionFields,
};

const STATUS_PENDING: i16 = 0;
const STATUS_READY: i16 = 1;
const STATUS_FAILED: i16 = 2;

const DEFAULT_LIVENESS_WINDOW_SECS: u64 = 30;

/// Relational job repository and liveness prober. Mutual exclusion for
/// claiming a range rides on the unique index over `pending_key`; no
/// application-level locking is involved.
#[derive(Clone)]
pub struct PreaggStore {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    clock: Arc<dyn Clock>,
    liveness_window: chrono::Duration,
}

impl PreaggStore {
    pub async fn connect(
        config: &PreaggConfig,
        base_dir: &Path,
        clock: Arc<dyn Clock>,
    ) -> PreaggResult<Self> {
        let url = build_connection_url(config, base_dir)?;
        let mut options = ConnectOptions::new(url);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        let conn = Database::connect(options).await.map_err(PreaggError::from)?;
        let backend = conn.get_database_backend();
        let liveness_window = chrono::Duration::seconds(
            config
                .liveness_window_secs
                .unwrap_or(DEFAULT_LIVENESS_WINDOW_SECS) as i64,
        );
        let store = Self {
            conn,
            backend,
            clock,
            liveness_window,
        };
        Migrator::up(&store.conn, None)
            .await
            .map_err(PreaggError::from)?;
        store.record_schema_version().await?;
        Ok(store)
    }

    async fn record_schema_version(&self) -> PreaggResult<()> {
        let insert = Query::insert()
            .into_table(PreaggSchemaVersion::Table)
            .columns([
                PreaggSchemaVersion::Version,
                PreaggSchemaVersion::AppliedAtMillis,
            ])
            .values_panic([
                env!("CARGO_PKG_VERSION").into(),
                self.clock.now().timestamp_millis().into(),
            ])
            .on_conflict(
                OnConflict::column(PreaggSchemaVersion::Version)
                    .do_nothing()
                    .to_owned(),
            )
            .to_owned();
        exec_count(&self.conn, &insert).await?;
        Ok(())
    }

    /// Refreshes the heartbeat for an in-flight computation. Owners call
    /// this periodically while `compute` runs so peers can tell a slow
    /// computation from a dead one.
    pub async fn record_heartbeat(&self, job_id: JobId) -> PreaggResult<()> {
        let update = Query::update()
            .table(PreaggHeartbeats::Table)
            .value(
                PreaggHeartbeats::LastBeatAt,
                self.clock.now().timestamp_millis(),
            )
            .and_where(Expr::col(PreaggHeartbeats::JobId).eq(job_id.to_string()))
            .to_owned();
        if exec_count(&self.conn, &update).await? == 0 {
            return Err(PreaggError::storage(format!(
                "heartbeat for job {job_id} with no started computation"
            )));
        }
        Ok(())
    }

    async fn team_of_job(&self, job_id: JobId) -> PreaggResult<TeamId> {
        let select = Query::select()
            .from(PreaggJobs::Table)
            .column(PreaggJobs::TeamId)
            .and_where(Expr::col(PreaggJobs::JobId).eq(job_id.to_string()))
            .limit(1)
            .to_owned();
        let row = query_one(&self.conn, &select)
            .await?
            .ok_or_else(|| PreaggError::storage(format!("unknown job {job_id}")))?;
        let team: i64 = row.try_get("", &col_name(PreaggJobs::TeamId))?;
        Ok(TeamId(team))
    }
}

#[async_trait]
impl JobRepository for PreaggStore {
    async fn find_existing(
        &self,
        team: TeamId,
        query_hash: &str,
        range: TimeRange,
    ) -> PreaggResult<Vec<Job>> {
        let now = self.clock.now();
        let select = Query::select()
            .from(PreaggJobs::Table)
            .columns(JOB_COLUMNS)
            .and_where(Expr::col(PreaggJobs::TeamId).eq(team.0))
            .and_where(Expr::col(PreaggJobs::QueryHash).eq(query_hash))
            .and_where(Expr::col(PreaggJobs::RangeStart).lt(range.end.timestamp_millis()))
            .and_where(Expr::col(PreaggJobs::RangeEnd).gt(range.start.timestamp_millis()))
            .and_where(Expr::col(PreaggJobs::Status).is_in([STATUS_PENDING, STATUS_READY]))
            .and_where(Expr::col(PreaggJobs::ExpiresAt).gt(now.timestamp_millis()))
            .order_by(PreaggJobs::RangeStart, Order::Asc)
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn create(
        &self,
        team: TeamId,
        query_hash: &str,
        range: TimeRange,
        ttl_seconds: u64,
    ) -> PreaggResult<CreateOutcome> {
        let now = self.clock.now();
        let job = Job {
            id: JobId::new(),
            team_id: team,
            query_hash: query_hash.to_string(),
            range,
            status: JobStatus::Pending,
            expires_at: now + chrono::Duration::seconds(ttl_seconds as i64),
            computed_at: None,
            error: None,
            created_at: now,
        };
        let insert = Query::insert()
            .into_table(PreaggJobs::Table)
            .columns([
                PreaggJobs::JobId,
                PreaggJobs::TeamId,
                PreaggJobs::QueryHash,
                PreaggJobs::RangeStart,
                PreaggJobs::RangeEnd,
                PreaggJobs::Status,
                PreaggJobs::ExpiresAt,
                PreaggJobs::ComputedAt,
                PreaggJobs::ErrorMessage,
                PreaggJobs::CreatedAt,
                PreaggJobs::PendingKey,
            ])
            .values_panic([
                job.id.to_string().into(),
                team.0.into(),
                query_hash.into(),
                range.start.timestamp_millis().into(),
                range.end.timestamp_millis().into(),
                STATUS_PENDING.into(),
                job.expires_at.timestamp_millis().into(),
                SeaValue::BigInt(None).into(),
                SeaValue::String(None).into(),
                now.timestamp_millis().into(),
                pending_key(team, query_hash, range).into(),
            ])
            .on_conflict(
                OnConflict::column(PreaggJobs::PendingKey)
                    .do_nothing()
                    .to_owned(),
            )
            .to_owned();
        if exec_count(&self.conn, &insert).await? == 0 {
            return Ok(CreateOutcome::AlreadyClaimed);
        }
        Ok(CreateOutcome::Created(job))
    }

    async fn transition_if_status(
        &self,
        job_id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> PreaggResult<bool> {
        let mut update = Query::update()
            .table(PreaggJobs::Table)
            .value(PreaggJobs::Status, status_code(new_status))
            .and_where(Expr::col(PreaggJobs::JobId).eq(job_id.to_string()))
            .and_where(Expr::col(PreaggJobs::Status).eq(status_code(expected)))
            .to_owned();
        if new_status.is_terminal() {
            update.value(PreaggJobs::PendingKey, SeaValue::String(None));
        }
        if let Some(computed_at) = fields.computed_at {
            update.value(PreaggJobs::ComputedAt, computed_at.timestamp_millis());
        }
        if let Some(error) = fields.error {
            update.value(PreaggJobs::ErrorMessage, error);
        }
        Ok(exec_count(&self.conn, &update).await? > 0)
    }
}

#[async_trait]
impl LivenessProber for PreaggStore {
    async fn mark_computation_started(&self, job_id: JobId) -> PreaggResult<()> {
        let team = self.team_of_job(job_id).await?;
        let now = self.clock.now().timestamp_millis();
        let insert = Query::insert()
            .into_table(PreaggHeartbeats::Table)
            .columns([
                PreaggHeartbeats::JobId,
                PreaggHeartbeats::TeamId,
                PreaggHeartbeats::StartedAt,
                PreaggHeartbeats::LastBeatAt,
            ])
            .values_panic([job_id.to_string().into(), team.0.into(), now.into(), now.into()])
            .on_conflict(
                OnConflict::column(PreaggHeartbeats::JobId)
                    .do_nothing()
                    .to_owned(),
            )
            .to_owned();
        if exec_count(&self.conn, &insert).await? == 0 {
            return Err(PreaggError::conflict(format!(
                "computation already marked started for job {job_id}"
            )));
        }
        Ok(())
    }

    async fn has_computation_started(&self, job_id: JobId) -> PreaggResult<bool> {
        let select = Query::select()
            .from(PreaggHeartbeats::Table)
            .column(PreaggHeartbeats::JobId)
            .and_where(Expr::col(PreaggHeartbeats::JobId).eq(job_id.to_string()))
            .limit(1)
            .to_owned();
        Ok(query_one(&self.conn, &select).await?.is_some())
    }

    async fn is_computation_alive(&self, team: TeamId, job_id: JobId) -> PreaggResult<bool> {
        let horizon = self.clock.now() - self.liveness_window;
        let select = Query::select()
            .from(PreaggHeartbeats::Table)
            .column(PreaggHeartbeats::JobId)
            .and_where(Expr::col(PreaggHeartbeats::JobId).eq(job_id.to_string()))
            .and_where(Expr::col(PreaggHeartbeats::TeamId).eq(team.0))
            .and_where(Expr::col(PreaggHeartbeats::LastBeatAt).gte(horizon.timestamp_millis()))
            .limit(1)
            .to_owned();
        Ok(query_one(&self.conn, &select).await?.is_some())
    }
}

const JOB_COLUMNS: [PreaggJobs; 10] = [
    PreaggJobs::JobId,
    PreaggJobs::TeamId,
    PreaggJobs::QueryHash,
    PreaggJobs::RangeStart,
    PreaggJobs::RangeEnd,
    PreaggJobs::Status,
    PreaggJobs::ExpiresAt,
    PreaggJobs::ComputedAt,
    PreaggJobs::ErrorMessage,
    PreaggJobs::CreatedAt,
];

fn pending_key(team: TeamId, query_hash: &str, range: TimeRange) -> String {
    format!(
        "{}:{}:{}:{}",
        team.0,
        query_hash,
        range.start.timestamp_millis(),
        range.end.timestamp_millis()
    )
}

fn status_code(status: JobStatus) -> i16 {
    match status {
        JobStatus::Pending => STATUS_PENDING,
        JobStatus::Ready => STATUS_READY,
        JobStatus::Failed => STATUS_FAILED,
    }
}

fn status_from_code(code: i16) -> PreaggResult<JobStatus> {
    match code {
        STATUS_PENDING => Ok(JobStatus::Pending),
        STATUS_READY => Ok(JobStatus::Ready),
        STATUS_FAILED => Ok(JobStatus::Failed),
        other => Err(PreaggError::storage(format!("invalid job status {other}"))),
    }
}

fn read_millis(row: &QueryResult, column: impl sea_query::Iden) -> PreaggResult<DateTime<Utc>> {
    let millis: i64 = row.try_get("", &col_name(column))?;
    from_millis(millis)
}

fn from_millis(millis: i64) -> PreaggResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| PreaggError::storage(format!("invalid timestamp {millis}")))
}

fn row_to_job(row: &QueryResult) -> PreaggResult<Job> {
    let id_text: String = row.try_get("", &col_name(PreaggJobs::JobId))?;
    let team: i64 = row.try_get("", &col_name(PreaggJobs::TeamId))?;
    let query_hash: String = row.try_get("", &col_name(PreaggJobs::QueryHash))?;
    let range = TimeRange::new(
        read_millis(row, PreaggJobs::RangeStart)?,
        read_millis(row, PreaggJobs::RangeEnd)?,
    );
    let status: i16 = row.try_get("", &col_name(PreaggJobs::Status))?;
    let computed_at: Option<i64> = row.try_get("", &col_name(PreaggJobs::ComputedAt))?;
    let error: Option<String> = row.try_get("", &col_name(PreaggJobs::ErrorMessage))?;
    Ok(Job {
        id: JobId(preagg_core::Id::from_uuid_str(&id_text)?),
        team_id: TeamId(team),
        query_hash,
        range,
        status: status_from_code(status)?,
        expires_at: read_millis(row, PreaggJobs::ExpiresAt)?,
        computed_at: computed_at.map(from_millis).transpose()?,
        error,
        created_at: read_millis(row, PreaggJobs::CreatedAt)?,
    })
}

fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

async fn exec_count<C, S>(conn: &C, stmt: &S) -> PreaggResult<u64>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let result = conn
        .execute(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(result.rows_affected())
}

async fn query_all<C, S>(conn: &C, stmt: &S) -> PreaggResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let rows = conn
        .query_all(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

async fn query_one<C, S>(conn: &C, stmt: &S) -> PreaggResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let row = conn
        .query_one(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(row)
}

fn build_connection_url(config: &PreaggConfig, base_dir: &Path) -> PreaggResult<String> {
    match &config.database {
        crate::DatabaseConfig::Sqlite { .. } => {
            let path = config.sqlite_path(base_dir)?;
            Ok(format!("sqlite://{}?mode=rwc", path.display()))
        }
        crate::DatabaseConfig::Postgres { url } => Ok(url.clone()),
        crate::DatabaseConfig::Mysql { url } => Ok(url.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::{pending_key, status_code, status_from_code};
    use chrono::{TimeZone, Utc};
    use preagg_core::{JobStatus, TeamId, TimeRange};

    #[test]
    fn status_codes_roundtrip() {
        for status in [JobStatus::Pending, JobStatus::Ready, JobStatus::Failed] {
            assert_eq!(status_from_code(status_code(status)).unwrap(), status);
        }
        assert!(status_from_code(9).is_err());
    }

    #[test]
    fn pending_key_identifies_the_exact_claim() {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap(),
        );
        let key = pending_key(TeamId(7), "abc123", range);
        assert_eq!(key, "7:abc123:1748736000000:1748822400000");
    }
}
