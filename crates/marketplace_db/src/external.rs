//! Mirror repository: idempotent writes into the external system-of-record
//! tables (`product`, `job_3dgs`, `fault_description`) that the seller site
//! reads directly. Every write here is a conditional UPDATE-or-INSERT so a
//! retried reconciliation pass never double-counts.

use chrono::Utc;
use marketplace_protocol::defaults::DEFAULT_ACTIVATION_THRESHOLD;
use marketplace_protocol::types::{Condition, Defect, ProductVerdict};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::Result;

#[derive(Clone)]
pub struct ExternalMirror {
    pool: SqlitePool,
    activation_threshold: i64,
}

impl ExternalMirror {
    /// Build a mirror using the default activation threshold
    /// ([`DEFAULT_ACTIVATION_THRESHOLD`]). Use [`Self::with_activation_threshold`]
    /// to override it from configuration.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            activation_threshold: DEFAULT_ACTIVATION_THRESHOLD,
        }
    }

    pub fn with_activation_threshold(pool: SqlitePool, activation_threshold: i64) -> Self {
        Self {
            pool,
            activation_threshold,
        }
    }

    /// Record that a recon job has been queued for `product_id`, upserting
    /// the `job_3dgs` row.
    pub async fn record_recon_queued(&self, product_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO job_3dgs (product_id, status, stage, progress, created_at, updated_at)
               VALUES (?, 'queued', 'queued', 0, ?, ?)
               ON CONFLICT(product_id) DO UPDATE SET
                 status = 'queued', stage = 'queued', progress = 0, updated_at = excluded.updated_at"#,
        )
        .bind(product_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mirror an in-progress stage/progress update for a recon job.
    pub async fn record_recon_progress(
        &self,
        product_id: &str,
        stage: &str,
        progress: u8,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"UPDATE job_3dgs SET status = 'running', stage = ?, progress = ?, updated_at = ?
               WHERE product_id = ?"#,
        )
        .bind(stage)
        .bind(progress as i64)
        .bind(&now)
        .bind(product_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mirror a recon job's terminal outcome and, on success, bump the
    /// product's completed-pipeline counter, flipping `sell_status` to
    /// `active` once the activation threshold is reached.
    pub async fn record_recon_terminal(
        &self,
        product_id: &str,
        succeeded: bool,
        error_message: Option<&str>,
        ply_url: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let status = if succeeded { "done" } else { "failed" };
        sqlx::query(
            r#"UPDATE job_3dgs SET status = ?, error_message = ?, updated_at = ?
               WHERE product_id = ?"#,
        )
        .bind(status)
        .bind(error_message)
        .bind(&now)
        .bind(product_id)
        .execute(&self.pool)
        .await?;

        if succeeded {
            self.ensure_product_row(product_id).await?;
            sqlx::query(
                r#"UPDATE product SET ply_url = ?, updated_at = ? WHERE product_id = ?"#,
            )
            .bind(ply_url)
            .bind(&now)
            .bind(product_id)
            .execute(&self.pool)
            .await?;
            self.bump_job_count(product_id).await?;
        } else {
            self.ensure_product_row(product_id).await?;
            sqlx::query(
                r#"UPDATE product SET sell_status = 'failed', updated_at = ? WHERE product_id = ?"#,
            )
            .bind(&now)
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        }

        info!(product_id, succeeded, "recon job mirrored as terminal");
        Ok(())
    }

    /// Record a per-image fault description finding and, once all images for
    /// a job have been aggregated, the product-level verdict plus the
    /// completed-pipeline bump.
    pub async fn record_analysis_terminal(&self, verdict: &ProductVerdict) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.ensure_product_row(&verdict.product_id).await?;
        sqlx::query(
            r#"UPDATE product SET condition_grade = ?, price_adjustment = ?, updated_at = ?
               WHERE product_id = ?"#,
        )
        .bind(verdict.condition.to_string())
        .bind(verdict.price_adjustment)
        .bind(&now)
        .bind(&verdict.product_id)
        .execute(&self.pool)
        .await?;
        self.bump_job_count(&verdict.product_id).await?;

        info!(product_id = %verdict.product_id, condition = %verdict.condition, "analysis job mirrored as terminal");
        Ok(())
    }

    /// Record one image's fault findings, keyed by (product_id, image_ref) so
    /// a retried analysis overwrites rather than duplicates.
    pub async fn record_image_fault_description(
        &self,
        product_id: &str,
        image_ref: &str,
        condition: Condition,
        price_adjustment: i32,
        defects: &[Defect],
        markdown: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let defects_json = serde_json::to_string(defects).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            r#"INSERT INTO fault_description
                 (product_id, image_ref, condition_grade, price_adjustment, defects_json, markdown, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(product_id, image_ref) DO UPDATE SET
                 condition_grade = excluded.condition_grade,
                 price_adjustment = excluded.price_adjustment,
                 defects_json = excluded.defects_json,
                 markdown = excluded.markdown,
                 created_at = excluded.created_at"#,
        )
        .bind(product_id)
        .bind(image_ref)
        .bind(condition.to_string())
        .bind(price_adjustment)
        .bind(defects_json)
        .bind(markdown)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_product_row(&self, product_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO product (product_id, sell_status, job_count, updated_at)
               VALUES (?, 'pending', 0, ?)
               ON CONFLICT(product_id) DO NOTHING"#,
        )
        .bind(product_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Increment the completed-pipeline counter and activate the product
    /// once it reaches `self.activation_threshold`.
    async fn bump_job_count(&self, product_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"UPDATE product SET job_count = job_count + 1, updated_at = ? WHERE product_id = ?"#,
        )
        .bind(&now)
        .bind(product_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"UPDATE product SET sell_status = 'active', updated_at = ?
               WHERE product_id = ? AND job_count >= ? AND sell_status != 'active'"#,
        )
        .bind(&now)
        .bind(product_id)
        .bind(self.activation_threshold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn sell_status(&self, product_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT sell_status FROM product WHERE product_id = ?")
                .bind(product_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(s,)| s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open_sqlite_pool;
    use crate::schema::ensure_external_schema;
    use chrono::Utc as ChronoUtc;

    async fn mirror() -> ExternalMirror {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        ensure_external_schema(&pool).await.unwrap();
        ExternalMirror::new(pool)
    }

    fn verdict(product_id: &str, condition: Condition) -> ProductVerdict {
        ProductVerdict {
            product_id: product_id.to_string(),
            condition,
            price_adjustment: -10,
            total_defects: 2,
            markdown: "## result".to_string(),
            completed_at: ChronoUtc::now(),
        }
    }

    #[tokio::test]
    async fn activation_flips_at_threshold() {
        let mirror = mirror().await;
        mirror.record_analysis_terminal(&verdict("p1", Condition::B)).await.unwrap();
        assert_eq!(mirror.sell_status("p1").await.unwrap().as_deref(), Some("pending"));

        mirror.record_recon_terminal("p1", true, None, Some("https://example/p1.ply")).await.unwrap();
        assert_eq!(mirror.sell_status("p1").await.unwrap().as_deref(), Some("pending"));

        mirror.record_analysis_terminal(&verdict("p1", Condition::B)).await.unwrap();
        assert_eq!(mirror.sell_status("p1").await.unwrap().as_deref(), Some("active"));
    }

    #[tokio::test]
    async fn activation_threshold_is_configurable() {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        ensure_external_schema(&pool).await.unwrap();
        let mirror = ExternalMirror::with_activation_threshold(pool, 1);

        mirror.record_analysis_terminal(&verdict("p9", Condition::A)).await.unwrap();
        assert_eq!(mirror.sell_status("p9").await.unwrap().as_deref(), Some("active"));
    }

    #[tokio::test]
    async fn failed_recon_sets_sell_status_failed_without_bumping_job_count() {
        let mirror = mirror().await;
        mirror.record_recon_queued("p2").await.unwrap();
        mirror.record_recon_terminal("p2", false, Some("colmap failed"), None).await.unwrap();
        assert_eq!(mirror.sell_status("p2").await.unwrap().as_deref(), Some("failed"));

        let row: (i64,) = sqlx::query_as("SELECT job_count FROM product WHERE product_id = ?")
            .bind("p2")
            .fetch_one(&mirror.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn fault_description_upsert_is_idempotent() {
        let mirror = mirror().await;
        mirror
            .record_image_fault_description("p3", "img-1", Condition::A, -5, &[], "first")
            .await
            .unwrap();
        mirror
            .record_image_fault_description("p3", "img-1", Condition::C, -20, &[], "retried")
            .await
            .unwrap();

        let row: (String, i64) = sqlx::query_as(
            "SELECT condition_grade, price_adjustment FROM fault_description WHERE product_id = ? AND image_ref = ?",
        )
        .bind("p3")
        .bind("img-1")
        .fetch_one(&mirror.pool)
        .await
        .unwrap();
        assert_eq!(row.0, "C");
        assert_eq!(row.1, -20);
    }
}
