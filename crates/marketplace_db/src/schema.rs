//! Schema creation for both databases this crate talks to: the JobStore's own
//! sqlite file, and the external system-of-record mirror. Single source of
//! truth for every `CREATE TABLE` statement - ported by hand from the
//! SQLAlchemy models in the original job orchestrator.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::Result;

/// Create the `jobs` table backing JobStore, if absent.
pub async fn ensure_jobstore_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS jobs (
            product_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            stage TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            image_count INTEGER NOT NULL DEFAULT 0,
            iterations INTEGER,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error_kind TEXT,
            error_stage TEXT,
            error_message TEXT,
            log_tail TEXT NOT NULL DEFAULT '[]'
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_kind ON jobs(kind)")
        .execute(pool)
        .await?;

    info!("jobstore schema verified");
    Ok(())
}

/// Create the external mirror's tables, if absent: `product` (the
/// system-of-record row the seller site reads), `job_3dgs` (recon job
/// mirror), and `fault_description` (per-image defect findings).
pub async fn ensure_external_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS product (
            product_id TEXT PRIMARY KEY,
            sell_status TEXT NOT NULL DEFAULT 'pending',
            condition_grade TEXT,
            price_adjustment INTEGER,
            job_count INTEGER NOT NULL DEFAULT 0,
            ply_url TEXT,
            updated_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS job_3dgs (
            product_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            stage TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS fault_description (
            product_id TEXT NOT NULL,
            image_ref TEXT NOT NULL,
            condition_grade TEXT NOT NULL,
            price_adjustment INTEGER NOT NULL,
            defects_json TEXT NOT NULL,
            markdown TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (product_id, image_ref)
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_product_sell_status ON product(sell_status)")
        .execute(pool)
        .await?;

    info!("external mirror schema verified");
    Ok(())
}
