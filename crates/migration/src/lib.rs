pub use sea_orm_migration::prelude::*;

mod m20261018_000001_add_subscriber_table;
mod m20261018_000002_add_dispatch_queue_tables;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261018_000001_add_subscriber_table::Migration),
            Box::new(m20261018_000002_add_dispatch_queue_tables::Migration),
        ]
    }
}
