//! Staging writes and resolution to canonical nomenclature

use serde_json::json;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;

use super::matcher::{self, MatchDecision};
use super::normalize::{category_key, normalize_article, normalize_category, Normalizer};
use super::parse::parse_listing;
use super::types::{
    IngestOutcome, MatchMethod, NomenclatureEntity, Outlet, ParsedListing, Resolution,
    ResolvedObservation, ScoredCandidate, StagingRecord,
};
use crate::clock::SharedClock;
use crate::config::MatchingConfig;
use crate::error::{PipelineError, PipelineResult};

/// Accepts raw listings and ties them to canonical products
#[derive(Clone)]
pub struct IngestionStage {
    pool: PgPool,
    clock: SharedClock,
    normalizer: Arc<Normalizer>,
    policy: MatchingConfig,
}

/// Fields shared by every new nomenclature row
struct NewEntity<'a> {
    source_id: &'a str,
    canonical_name: &'a str,
    normalized_name: &'a str,
    article: Option<&'a str>,
    normalized_article: Option<&'a str>,
    brand: Option<&'a str>,
    category_path: &'a [String],
    category_key: &'a str,
}

impl IngestionStage {
    pub fn new(pool: PgPool, clock: SharedClock, policy: MatchingConfig) -> PipelineResult<Self> {
        let normalizer = Normalizer::new(&policy.extra_boilerplate)?;
        Ok(Self {
            pool,
            clock,
            normalizer: Arc::new(normalizer),
            policy,
        })
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Create or update an outlet; returns the stored row
    pub async fn register_outlet(
        &self,
        source_id: &str,
        code: &str,
        city: Option<&str>,
        region: Option<&str>,
    ) -> PipelineResult<Outlet> {
        let outlet = sqlx::query_as(
            r#"
            INSERT INTO outlets (source_id, code, city, region)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_id, code) DO UPDATE
            SET city = COALESCE(EXCLUDED.city, outlets.city),
                region = COALESCE(EXCLUDED.region, outlets.region)
            RETURNING id, source_id, code, city, region
            "#,
        )
        .bind(source_id)
        .bind(code.trim())
        .bind(city)
        .bind(region)
        .fetch_one(&self.pool)
        .await?;
        Ok(outlet)
    }

    /// Store the record verbatim, then resolve it
    ///
    /// The staging row is written before any parsing decision, so malformed
    /// and ambiguous records remain inspectable alongside their review item.
    #[tracing::instrument(skip(self, record), fields(source_id = %record.source_id, url = %record.url))]
    pub async fn ingest(&self, record: StagingRecord) -> PipelineResult<IngestOutcome> {
        let parsed = parse_listing(&record);
        let staging_id = self.insert_staging(&record, parsed.as_ref().ok()).await?;

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(err @ PipelineError::MalformedRecord { .. }) => {
                let reason = err.to_string();
                let review_id = self
                    .flag_malformed(staging_id, &record.source_id, &reason)
                    .await?;
                tracing::warn!(staging_id, review_id, reason = %reason, "Malformed record flagged for review");
                return Ok(IngestOutcome::Malformed {
                    staging_id,
                    review_id,
                    reason,
                });
            }
            Err(other) => return Err(other),
        };

        let outlet = self
            .register_outlet(&record.source_id, &record.outlet_code, None, None)
            .await?;

        let (entity, method, status, score) = match self.resolve(&record).await? {
            Resolution::Ambiguous(candidates) => {
                let review_id = self
                    .flag_ambiguous(staging_id, &record.source_id, &candidates)
                    .await?;
                tracing::info!(
                    staging_id,
                    review_id,
                    candidates = candidates.len(),
                    "Ambiguous match queued for review"
                );
                return Ok(IngestOutcome::Ambiguous {
                    staging_id,
                    review_id,
                    candidates,
                });
            }
            Resolution::Matched {
                entity,
                method: MatchMethod::Article,
                score,
            } => (entity, Some(MatchMethod::Article), "matched_article", Some(score)),
            Resolution::Matched {
                entity,
                method: MatchMethod::Name,
                score,
            } => (entity, Some(MatchMethod::Name), "matched_name", Some(score)),
            Resolution::Created(entity) => (entity, None, "created", None),
        };

        self.record_resolution(staging_id, status, Some(entity.id), score)
            .await?;

        Ok(IngestOutcome::Resolved {
            observation: observation(staging_id, entity, outlet, parsed, record.scraped_at),
            method,
        })
    }

    /// Match a record against the catalog, creating an entity when nothing
    /// is close enough
    ///
    /// A record with an article only ever matches on that article. Name
    /// matching for one (source, category) is serialised with an advisory
    /// lock so two workers cannot both create the same product.
    pub async fn resolve(&self, record: &StagingRecord) -> PipelineResult<Resolution> {
        let normalized_name = self.normalizer.name(&record.name);
        let category_path = normalize_category(&record.category_path);
        let key = category_key(&record.category_path);
        let article = record
            .article
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty());
        let normalized_article = article.and_then(normalize_article);

        let new = NewEntity {
            source_id: &record.source_id,
            canonical_name: record.name.trim(),
            normalized_name: &normalized_name,
            article,
            normalized_article: normalized_article.as_deref(),
            brand: record.brand.as_deref(),
            category_path: &category_path,
            category_key: &key,
        };

        if new.normalized_article.is_some() {
            return self.resolve_by_article(&new).await;
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
            .bind(&record.source_id)
            .bind(&key)
            .execute(&mut *tx)
            .await?;

        let candidates: Vec<NomenclatureEntity> = sqlx::query_as(
            r#"
            SELECT * FROM nomenclature
            WHERE source_id = $1 AND (category_key = $2 OR normalized_name = $3)
            ORDER BY (normalized_name = $3) DESC, id
            LIMIT $4
            "#,
        )
        .bind(&record.source_id)
        .bind(&key)
        .bind(&normalized_name)
        .bind(self.policy.candidate_limit)
        .fetch_all(&mut *tx)
        .await?;

        let scored: Vec<ScoredCandidate> = candidates
            .iter()
            .map(|c| ScoredCandidate {
                nomenclature_id: c.id,
                canonical_name: c.canonical_name.clone(),
                score: matcher::score(&normalized_name, &category_path, &c.normalized_name, &c.category_path),
            })
            .collect();

        let resolution = match matcher::decide(scored, &self.policy) {
            MatchDecision::Accept(best) => {
                let entity = candidates
                    .into_iter()
                    .find(|c| c.id == best.nomenclature_id)
                    .ok_or(sqlx::Error::RowNotFound)?;
                Resolution::Matched {
                    entity,
                    method: MatchMethod::Name,
                    score: best.score,
                }
            }
            MatchDecision::Review(candidates) => Resolution::Ambiguous(candidates),
            MatchDecision::NoMatch => {
                let entity = insert_entity(&mut tx, &new, self.clock.now()).await?;
                tracing::debug!(nomenclature_id = entity.id, "Created nomenclature entity");
                Resolution::Created(entity)
            }
        };

        tx.commit().await?;
        Ok(resolution)
    }

    async fn resolve_by_article(&self, new: &NewEntity<'_>) -> PipelineResult<Resolution> {
        let row: PgRow = sqlx::query(
            r#"
            INSERT INTO nomenclature (
                source_id, canonical_name, normalized_name, article, normalized_article,
                brand, category_path, category_key, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_id, normalized_article) WHERE normalized_article IS NOT NULL
            DO UPDATE SET source_id = EXCLUDED.source_id
            RETURNING *, (xmax = 0) AS inserted
            "#,
        )
        .bind(new.source_id)
        .bind(new.canonical_name)
        .bind(new.normalized_name)
        .bind(new.article)
        .bind(new.normalized_article)
        .bind(new.brand)
        .bind(new.category_path)
        .bind(new.category_key)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await?;

        let entity = NomenclatureEntity::from_row(&row)?;
        let inserted: bool = row.try_get("inserted")?;

        Ok(if inserted {
            Resolution::Created(entity)
        } else {
            Resolution::Matched {
                entity,
                method: MatchMethod::Article,
                score: 1.0,
            }
        })
    }

    async fn insert_staging(
        &self,
        record: &StagingRecord,
        parsed: Option<&ParsedListing>,
    ) -> PipelineResult<i64> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO staging_records (
                source_id, outlet_code, raw_name, raw_article, category_path, brand,
                raw_price, raw_old_price, raw_quantity, price, old_price, quantity,
                url, scraped_at, ingested_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id
            "#,
        )
        .bind(&record.source_id)
        .bind(&record.outlet_code)
        .bind(&record.name)
        .bind(&record.article)
        .bind(&record.category_path)
        .bind(&record.brand)
        .bind(&record.price)
        .bind(&record.old_price)
        .bind(&record.quantity)
        .bind(parsed.map(|p| &p.price))
        .bind(parsed.and_then(|p| p.old_price.as_ref()))
        .bind(parsed.map(|p| p.quantity))
        .bind(&record.url)
        .bind(record.scraped_at)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn record_resolution(
        &self,
        staging_id: i64,
        status: &str,
        nomenclature_id: Option<i64>,
        score: Option<f64>,
    ) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO staging_resolutions (staging_id, status, nomenclature_id, score, resolved_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(staging_id)
        .bind(status)
        .bind(nomenclature_id)
        .bind(score)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn flag_malformed(&self, staging_id: i64, source_id: &str, reason: &str) -> PipelineResult<i64> {
        self.record_resolution(staging_id, "malformed", None, None).await?;
        self.enqueue_review(staging_id, source_id, "malformed_record", Some(reason), json!([]))
            .await
    }

    async fn flag_ambiguous(
        &self,
        staging_id: i64,
        source_id: &str,
        candidates: &[ScoredCandidate],
    ) -> PipelineResult<i64> {
        let best = candidates.first().map(|c| c.score);
        self.record_resolution(staging_id, "ambiguous", None, best).await?;
        let detail = format!("{} candidate(s) above review floor", candidates.len());
        self.enqueue_review(
            staging_id,
            source_id,
            "ambiguous_match",
            Some(&detail),
            serde_json::to_value(candidates)?,
        )
        .await
    }

    async fn enqueue_review(
        &self,
        staging_id: i64,
        source_id: &str,
        reason: &str,
        detail: Option<&str>,
        candidates: serde_json::Value,
    ) -> PipelineResult<i64> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO review_queue (staging_id, source_id, reason, detail, candidates, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(staging_id)
        .bind(source_id)
        .bind(reason)
        .bind(detail)
        .bind(candidates)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Create an entity straight from a staged record (review `CreateNew`)
    pub(crate) async fn create_from_staging(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &StagingRecord,
    ) -> PipelineResult<NomenclatureEntity> {
        let normalized_name = self.normalizer.name(&record.name);
        let category_path = normalize_category(&record.category_path);
        let key = category_key(&record.category_path);
        let new = NewEntity {
            source_id: &record.source_id,
            canonical_name: record.name.trim(),
            normalized_name: &normalized_name,
            article: None,
            normalized_article: None,
            brand: record.brand.as_deref(),
            category_path: &category_path,
            category_key: &key,
        };
        insert_entity(tx, &new, self.clock.now()).await
    }
}

async fn insert_entity(
    tx: &mut Transaction<'_, Postgres>,
    new: &NewEntity<'_>,
    now: chrono::DateTime<chrono::Utc>,
) -> PipelineResult<NomenclatureEntity> {
    let entity = sqlx::query_as(
        r#"
        INSERT INTO nomenclature (
            source_id, canonical_name, normalized_name, article, normalized_article,
            brand, category_path, category_key, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(new.source_id)
    .bind(new.canonical_name)
    .bind(new.normalized_name)
    .bind(new.article)
    .bind(new.normalized_article)
    .bind(new.brand)
    .bind(new.category_path)
    .bind(new.category_key)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(entity)
}

pub(crate) fn observation(
    staging_id: i64,
    entity: NomenclatureEntity,
    outlet: Outlet,
    parsed: ParsedListing,
    observed_at: chrono::DateTime<chrono::Utc>,
) -> ResolvedObservation {
    ResolvedObservation {
        staging_id,
        entity,
        outlet,
        price: parsed.price,
        old_price: parsed.old_price,
        quantity: parsed.quantity,
        observed_at,
    }
}
