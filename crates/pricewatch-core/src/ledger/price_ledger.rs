//! Snapshot-and-history engine
//!
//! `apply` is one transaction that locks the snapshot row for the pair, so
//! concurrent observations of the same (entity, outlet) serialise there and
//! history stays ordered. Different pairs never contend.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::types::{decide_change, ApplyOutcome, HistoryReason, PriceHistoryEntry, PriceSnapshot};
use crate::clock::SharedClock;
use crate::error::PipelineResult;
use crate::ingest::parse::round_price;
use crate::ingest::ResolvedObservation;

#[derive(Clone)]
pub struct PriceLedger {
    pool: PgPool,
    clock: SharedClock,
}

impl PriceLedger {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    pub async fn apply_observation(&self, observation: &ResolvedObservation) -> PipelineResult<ApplyOutcome> {
        self.apply(
            observation.entity.id,
            observation.outlet.id,
            &observation.price,
            observation.old_price.as_ref(),
            observation.quantity,
            observation.observed_at,
        )
        .await
    }

    /// Record one observation of a pair
    ///
    /// History is written only on first sight or when price or quantity
    /// differ; `old_price` follows the latest observation without a history
    /// entry of its own.
    #[tracing::instrument(skip(self, price, old_price))]
    pub async fn apply(
        &self,
        nomenclature_id: i64,
        outlet_id: i64,
        price: &BigDecimal,
        old_price: Option<&BigDecimal>,
        quantity: i32,
        observed_at: DateTime<Utc>,
    ) -> PipelineResult<ApplyOutcome> {
        let price = round_price(price);
        let old_price = old_price.map(round_price);
        let mut tx = self.pool.begin().await?;

        let mut current = lock_snapshot(&mut tx, nomenclature_id, outlet_id).await?;
        if current.is_none() {
            let inserted = sqlx::query(
                r#"
                INSERT INTO price_snapshots (
                    nomenclature_id, outlet_id, source_id, price, old_price, quantity, updated_at, last_seen_at
                )
                SELECT $1, $2, o.source_id, $3, $4, $5, $6, $6 FROM outlets o WHERE o.id = $2
                ON CONFLICT (nomenclature_id, outlet_id) DO NOTHING
                "#,
            )
            .bind(nomenclature_id)
            .bind(outlet_id)
            .bind(&price)
            .bind(&old_price)
            .bind(quantity)
            .bind(observed_at)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 1 {
                insert_history(&mut tx, nomenclature_id, outlet_id, None, None, &price, quantity, HistoryReason::FirstSeen, observed_at)
                    .await?;
                tx.commit().await?;
                tracing::debug!("First observation recorded");
                return Ok(ApplyOutcome::FirstSeen);
            }

            // lost the insert race; continue against the winner's row
            current = lock_snapshot(&mut tx, nomenclature_id, outlet_id).await?;
            if current.is_none() {
                return Err(sqlx::Error::RowNotFound.into());
            }
        }

        let outcome = decide_change(current.as_ref(), &price, quantity, observed_at);
        match (outcome, current) {
            (ApplyOutcome::Changed, Some(previous)) => {
                insert_history(
                    &mut tx,
                    nomenclature_id,
                    outlet_id,
                    Some(&previous.price),
                    Some(previous.quantity),
                    &price,
                    quantity,
                    HistoryReason::Changed,
                    observed_at,
                )
                .await?;
                sqlx::query(
                    r#"
                    UPDATE price_snapshots
                    SET price = $3, old_price = $4, quantity = $5, updated_at = $6, last_seen_at = $6
                    WHERE nomenclature_id = $1 AND outlet_id = $2
                    "#,
                )
                .bind(nomenclature_id)
                .bind(outlet_id)
                .bind(&price)
                .bind(&old_price)
                .bind(quantity)
                .bind(observed_at)
                .execute(&mut *tx)
                .await?;
                tracing::info!(
                    previous_price = %previous.price,
                    price = %price,
                    previous_quantity = previous.quantity,
                    quantity,
                    "Price change recorded"
                );
            }
            (ApplyOutcome::Unchanged, _) => {
                sqlx::query(
                    r#"
                    UPDATE price_snapshots
                    SET old_price = $3, last_seen_at = $4
                    WHERE nomenclature_id = $1 AND outlet_id = $2
                    "#,
                )
                .bind(nomenclature_id)
                .bind(outlet_id)
                .bind(&old_price)
                .bind(observed_at)
                .execute(&mut *tx)
                .await?;
            }
            (ApplyOutcome::Stale, _) => {
                tracing::debug!(observed_at = %observed_at, "Ignoring observation older than snapshot");
            }
            _ => {}
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Zero the quantity of every snapshot of `source_id` not seen since
    /// `run_started_at`, with one `stale` history entry each
    ///
    /// Snapshots already at zero are left alone, so repeated calls for the
    /// same run write nothing new.
    #[tracing::instrument(skip(self))]
    pub async fn mark_stale(&self, source_id: &str, run_started_at: DateTime<Utc>) -> PipelineResult<u64> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            WITH previous AS (
                SELECT nomenclature_id, outlet_id, quantity
                FROM price_snapshots
                WHERE source_id = $1 AND last_seen_at < $2 AND quantity > 0
                FOR UPDATE
            ),
            zeroed AS (
                UPDATE price_snapshots s
                SET quantity = 0, updated_at = $3
                FROM previous p
                WHERE s.nomenclature_id = p.nomenclature_id AND s.outlet_id = p.outlet_id
                RETURNING s.nomenclature_id, s.outlet_id, s.price, p.quantity AS previous_quantity
            )
            INSERT INTO price_history (
                nomenclature_id, outlet_id, previous_price, previous_quantity, price, quantity, reason, changed_at
            )
            SELECT nomenclature_id, outlet_id, price, previous_quantity, price, 0, 'stale', $3
            FROM zeroed
            "#,
        )
        .bind(source_id)
        .bind(run_started_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let marked = result.rows_affected();
        tracing::info!(source_id, marked, "Stale snapshots zeroed");
        Ok(marked)
    }

    pub async fn snapshot(&self, nomenclature_id: i64, outlet_id: i64) -> PipelineResult<Option<PriceSnapshot>> {
        let snapshot = sqlx::query_as(
            "SELECT * FROM price_snapshots WHERE nomenclature_id = $1 AND outlet_id = $2",
        )
        .bind(nomenclature_id)
        .bind(outlet_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(snapshot)
    }

    /// History of a pair in change order
    pub async fn history(&self, nomenclature_id: i64, outlet_id: i64) -> PipelineResult<Vec<PriceHistoryEntry>> {
        let entries = sqlx::query_as(
            r#"
            SELECT * FROM price_history
            WHERE nomenclature_id = $1 AND outlet_id = $2
            ORDER BY changed_at, id
            "#,
        )
        .bind(nomenclature_id)
        .bind(outlet_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

async fn lock_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    nomenclature_id: i64,
    outlet_id: i64,
) -> PipelineResult<Option<PriceSnapshot>> {
    let snapshot = sqlx::query_as(
        "SELECT * FROM price_snapshots WHERE nomenclature_id = $1 AND outlet_id = $2 FOR UPDATE",
    )
    .bind(nomenclature_id)
    .bind(outlet_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(snapshot)
}

#[allow(clippy::too_many_arguments)]
async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    nomenclature_id: i64,
    outlet_id: i64,
    previous_price: Option<&BigDecimal>,
    previous_quantity: Option<i32>,
    price: &BigDecimal,
    quantity: i32,
    reason: HistoryReason,
    changed_at: DateTime<Utc>,
) -> PipelineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO price_history (
            nomenclature_id, outlet_id, previous_price, previous_quantity, price, quantity, reason, changed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(nomenclature_id)
    .bind(outlet_id)
    .bind(previous_price)
    .bind(previous_quantity)
    .bind(price)
    .bind(quantity)
    .bind(reason.as_str())
    .bind(changed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
