//! Review queue for records the stage would not resolve on its own

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use std::str::FromStr;

use super::parse::parse_listing;
use super::stage::{observation, IngestionStage};
use super::types::{NomenclatureEntity, Outlet, ResolvedObservation, ScoredCandidate, StagingRecord};
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    AmbiguousMatch,
    MalformedRecord,
}

impl FromStr for ReviewReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ambiguous_match" => Ok(ReviewReason::AmbiguousMatch),
            "malformed_record" => Ok(ReviewReason::MalformedRecord),
            other => Err(format!("unknown review reason '{}'", other)),
        }
    }
}

/// Operator decision on a review item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Merge into this existing entity
    UseExisting(i64),
    /// The listing is a distinct product
    CreateNew,
    /// Drop the item without resolving the record
    Dismiss,
}

/// Pending review item (maps to `review_queue`)
#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem {
    pub id: i64,
    pub staging_id: i64,
    pub source_id: String,
    pub reason: ReviewReason,
    pub detail: Option<String>,
    pub candidates: Vec<ScoredCandidate>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ReviewItem {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        let reason: String = row.try_get("reason")?;
        let candidates: serde_json::Value = row.try_get("candidates")?;
        Ok(Self {
            id: row.try_get("id")?,
            staging_id: row.try_get("staging_id")?,
            source_id: row.try_get("source_id")?,
            reason: reason.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
                index: "reason".to_string(),
                source: e.into(),
            })?,
            detail: row.try_get("detail")?,
            candidates: serde_json::from_value(candidates).map_err(|e| sqlx::Error::ColumnDecode {
                index: "candidates".to_string(),
                source: Box::new(e),
            })?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Raw columns of a `staging_records` row
impl<'r> FromRow<'r, PgRow> for StagingRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            source_id: row.try_get("source_id")?,
            outlet_code: row.try_get("outlet_code")?,
            name: row.try_get("raw_name")?,
            article: row.try_get("raw_article")?,
            category_path: row.try_get("category_path")?,
            brand: row.try_get("brand")?,
            price: row.try_get("raw_price")?,
            old_price: row.try_get("raw_old_price")?,
            quantity: row.try_get("raw_quantity")?,
            url: row.try_get("url")?,
            scraped_at: row.try_get("scraped_at")?,
        })
    }
}

impl IngestionStage {
    /// Oldest pending review items, optionally for one source
    pub async fn pending_reviews(&self, source_id: Option<&str>, limit: i64) -> PipelineResult<Vec<ReviewItem>> {
        let items = sqlx::query_as(
            r#"
            SELECT id, staging_id, source_id, reason, detail, candidates, created_at
            FROM review_queue
            WHERE status = 'pending' AND ($1::text IS NULL OR source_id = $1)
            ORDER BY created_at, id
            LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(items)
    }

    /// Apply an operator decision
    ///
    /// Returns the observation to hand to the ledger when the decision ties
    /// the record to an entity. Malformed records can only be dismissed.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_review(
        &self,
        review_id: i64,
        decision: ReviewDecision,
        reviewed_by: &str,
    ) -> PipelineResult<Option<ResolvedObservation>> {
        let now = self.now();
        let mut tx = self.pool().begin().await?;

        let row: Option<(i64, String, String)> = sqlx::query_as(
            "SELECT staging_id, reason, status FROM review_queue WHERE id = $1 FOR UPDATE",
        )
        .bind(review_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((staging_id, reason, status)) = row else {
            return Err(PipelineError::ReviewNotFound(review_id));
        };
        if status != "pending" {
            return Err(PipelineError::InvalidReview(format!(
                "review {} is already {}",
                review_id, status
            )));
        }
        let reason: ReviewReason = reason.parse().map_err(PipelineError::InvalidReview)?;

        if decision == ReviewDecision::Dismiss {
            sqlx::query(
                r#"
                UPDATE review_queue
                SET status = 'dismissed', reviewed_by = $2, reviewed_at = $3
                WHERE id = $1
                "#,
            )
            .bind(review_id)
            .bind(reviewed_by)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            tracing::info!(review_id, reviewed_by, "Review dismissed");
            return Ok(None);
        }

        if reason == ReviewReason::MalformedRecord {
            return Err(PipelineError::InvalidReview(
                "malformed records can only be dismissed".to_string(),
            ));
        }

        let record: StagingRecord = sqlx::query_as("SELECT * FROM staging_records WHERE id = $1")
            .bind(staging_id)
            .fetch_one(&mut *tx)
            .await?;
        let parsed = parse_listing(&record)?;

        let entity: NomenclatureEntity = match decision {
            ReviewDecision::UseExisting(id) => {
                let existing: Option<NomenclatureEntity> =
                    sqlx::query_as("SELECT * FROM nomenclature WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?;
                match existing {
                    Some(entity) if entity.source_id == record.source_id => entity,
                    Some(_) => {
                        return Err(PipelineError::InvalidReview(format!(
                            "entity {} belongs to another source",
                            id
                        )))
                    }
                    None => {
                        return Err(PipelineError::InvalidReview(format!(
                            "entity {} does not exist",
                            id
                        )))
                    }
                }
            }
            ReviewDecision::CreateNew => self.create_from_staging(&mut tx, &record).await?,
            ReviewDecision::Dismiss => return Ok(None),
        };

        let outlet: Outlet = sqlx::query_as(
            r#"
            INSERT INTO outlets (source_id, code) VALUES ($1, $2)
            ON CONFLICT (source_id, code) DO UPDATE SET code = EXCLUDED.code
            RETURNING id, source_id, code, city, region
            "#,
        )
        .bind(&record.source_id)
        .bind(record.outlet_code.trim())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE review_queue
            SET status = 'resolved', resolved_nomenclature_id = $2, reviewed_by = $3, reviewed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(review_id)
        .bind(entity.id)
        .bind(reviewed_by)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE staging_resolutions
            SET status = 'reviewed', nomenclature_id = $2, resolved_at = $3
            WHERE staging_id = $1
            "#,
        )
        .bind(staging_id)
        .bind(entity.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(review_id, nomenclature_id = entity.id, reviewed_by, "Review resolved");
        Ok(Some(observation(staging_id, entity, outlet, parsed, record.scraped_at)))
    }
}
