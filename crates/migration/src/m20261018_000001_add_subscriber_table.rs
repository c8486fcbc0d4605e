use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Subscriber::Table)
                    .if_not_exists()
                    // Normalized (trimmed, lower-cased) address; the primary key is
                    // what makes the upsert conflict target unique.
                    .col(string(Subscriber::Email).primary_key().to_owned())
                    .col(
                        boolean(Subscriber::EmailVerified)
                            .default(false)
                            .not_null()
                            .to_owned(),
                    )
                    .col(string_null(Subscriber::VerificationToken))
                    .col(timestamp_with_time_zone_null(
                        Subscriber::VerificationSentAt,
                    ))
                    .col(timestamp_with_time_zone_null(Subscriber::VerifiedAt))
                    .col(timestamp_with_time_zone_null(Subscriber::UnsubscribedAt))
                    .col(timestamp_with_time_zone(Subscriber::SubscribedAt))
                    .col(string_null(Subscriber::IpAddress))
                    .col(text_null(Subscriber::UserAgent))
                    .col(string_null(Subscriber::Country))
                    .col(string_null(Subscriber::City))
                    .col(
                        timestamp_with_time_zone(Subscriber::CreatedAt)
                            .default(Expr::current_timestamp())
                            .to_owned(),
                    )
                    .col(
                        timestamp_with_time_zone(Subscriber::UpdatedAt)
                            .default(Expr::current_timestamp())
                            .to_owned(),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_subscriber_verified_active")
                    .table(Subscriber::Table)
                    .col(Subscriber::EmailVerified)
                    .col(Subscriber::UnsubscribedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_subscriber_verified_active")
                    .table(Subscriber::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(Subscriber::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Subscriber {
    Table,
    Email,
    EmailVerified,
    VerificationToken,
    VerificationSentAt,
    VerifiedAt,
    UnsubscribedAt,
    SubscribedAt,
    IpAddress,
    UserAgent,
    Country,
    City,
    CreatedAt,
    UpdatedAt,
}
