use sea_orm_migration::prelude::Iden;
use sea_orm_migration::sea_orm::sea_query;

#[derive(Iden, Clone, Copy)]
pub enum PreaggJobs {
    Table,
    JobId,
    TeamId,
    QueryHash,
    RangeStart,
    RangeEnd,
    Status,
    ExpiresAt,
    ComputedAt,
    ErrorMessage,
    CreatedAt,
    PendingKey,
}

#[derive(Iden, Clone, Copy)]
pub enum PreaggHeartbeats {
    Table,
    JobId,
    TeamId,
    StartedAt,
    LastBeatAt,
}

#[derive(Iden, Clone, Copy)]
pub enum PreaggSchemaVersion {
    Table,
    Version,
    AppliedAtMillis,
}
