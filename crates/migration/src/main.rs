use sea_orm_migration::prelude::*;
use std::env;

#[tokio::main]
async fn main() {
    // DATABASE_URL from the environment wins; otherwise fall back to the
    // same config.yaml the server reads.
    if env::var("DATABASE_URL").is_err() {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config.yaml"))
            .build();
        if let Ok(url) = settings.and_then(|s| s.get_string("database_url")) {
            env::set_var("DATABASE_URL", url);
        }
    }
    cli::run_cli(migration::Migrator).await;
}
