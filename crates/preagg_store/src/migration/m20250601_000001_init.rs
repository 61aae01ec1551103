use sea_orm_migration::prelude::*;

use crate::db::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PreaggSchemaVersion::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PreaggSchemaVersion::Version)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PreaggSchemaVersion::AppliedAtMillis)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PreaggJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PreaggJobs::JobId)
                            .string_len(36)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PreaggJobs::TeamId).big_integer().not_null())
                    .col(
                        ColumnDef::new(PreaggJobs::QueryHash)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PreaggJobs::RangeStart)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PreaggJobs::RangeEnd)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PreaggJobs::Status)
                            .small_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PreaggJobs::ExpiresAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(PreaggJobs::ComputedAt).big_integer())
                    .col(ColumnDef::new(PreaggJobs::ErrorMessage).text())
                    .col(
                        ColumnDef::new(PreaggJobs::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(PreaggJobs::PendingKey).string_len(255))
                    .to_owned(),
            )
            .await?;

        // Mutual-exclusion primitive: at most one pending job per
        // (team, query_hash, range). The key is NULLed by the terminal
        // transition, freeing the slot for recomputation.
        manager
            .create_index(
                Index::create()
                    .name("ux_preagg_jobs_pending_key")
                    .table(PreaggJobs::Table)
                    .col(PreaggJobs::PendingKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("ix_preagg_jobs_lookup")
                    .table(PreaggJobs::Table)
                    .col(PreaggJobs::TeamId)
                    .col(PreaggJobs::QueryHash)
                    .col(PreaggJobs::RangeStart)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PreaggHeartbeats::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PreaggHeartbeats::JobId)
                            .string_len(36)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PreaggHeartbeats::TeamId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PreaggHeartbeats::StartedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PreaggHeartbeats::LastBeatAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PreaggHeartbeats::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PreaggJobs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PreaggSchemaVersion::Table).to_owned())
            .await?;
        Ok(())
    }
}
