//! Schema migration CLI (`migration up`, `migration status`, ...).
//!
//! Uses `DATABASE_URL` when set; otherwise reads `database_url` from the service
//! configuration file (`NEWSLETTER_CONFIG`, default `config.yaml`).

use config::Config;
use sea_orm_migration::prelude::*;
use std::env;

fn database_url_from_config(path: &str) -> Result<Option<String>, config::ConfigError> {
    let settings = Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .build()?;
    match settings.get_string("database_url") {
        Ok(url) => Ok(Some(url)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn main() {
    if env::var("DATABASE_URL").is_err() {
        let path = env::var("NEWSLETTER_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
        match database_url_from_config(&path) {
            Ok(Some(url)) => env::set_var("DATABASE_URL", url),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Failed to read {path}: {e}");
                std::process::exit(1);
            }
        }
    }
    cli::run_cli(migration::Migrator).await;
}
