use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DispatchJob::Table)
                    .if_not_exists()
                    .col(string(DispatchJob::Id).primary_key().to_owned())
                    .col(text(DispatchJob::Payload))
                    .col(integer(DispatchJob::Attempts).default(0).to_owned())
                    .col(timestamp_with_time_zone(DispatchJob::AvailableAt))
                    .col(text_null(DispatchJob::LastError))
                    .col(
                        timestamp_with_time_zone(DispatchJob::CreatedAt)
                            .default(Expr::current_timestamp())
                            .to_owned(),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_dispatch_job_available_at")
                    .table(DispatchJob::Table)
                    .col(DispatchJob::AvailableAt)
                    .to_owned(),
            )
            .await?;
        manager
            .create_table(
                Table::create()
                    .table(DeadLetterJob::Table)
                    .if_not_exists()
                    .col(string(DeadLetterJob::Id).primary_key().to_owned())
                    .col(text(DeadLetterJob::Payload))
                    .col(integer(DeadLetterJob::Attempts))
                    .col(text_null(DeadLetterJob::LastError))
                    .col(timestamp_with_time_zone(DeadLetterJob::EnqueuedAt))
                    .col(timestamp_with_time_zone(DeadLetterJob::DeadLetteredAt))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeadLetterJob::Table).to_owned())
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_dispatch_job_available_at")
                    .table(DispatchJob::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(DispatchJob::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum DispatchJob {
    Table,
    Id,
    Payload,
    Attempts,
    AvailableAt,
    LastError,
    CreatedAt,
}

#[derive(Iden)]
enum DeadLetterJob {
    Table,
    Id,
    Payload,
    Attempts,
    LastError,
    EnqueuedAt,
    DeadLetteredAt,
}
