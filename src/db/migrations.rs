use crate::db::schema::*;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // Composite primary keys double as the per-location lookup indexes
    sqlx::query(CREATE_LOCATIONS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_PHOTOS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_TOMBSTONES_TABLE).execute(pool).await?;

    Ok(())
}
