use sqlx::migrate::{MigrateError, Migrator};

use crate::StorePool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &StorePool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
