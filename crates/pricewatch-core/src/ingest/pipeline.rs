//! Ingestion stage wired to the price ledger

use sqlx::PgPool;

use super::review::ReviewDecision;
use super::stage::IngestionStage;
use super::types::{IngestOutcome, ResolvedObservation, StagingRecord};
use crate::clock::SharedClock;
use crate::config::MatchingConfig;
use crate::error::PipelineResult;
use crate::ledger::{ApplyOutcome, PriceLedger};

/// Result of pushing one record through staging and the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Applied {
        observation: ResolvedObservation,
        outcome: ApplyOutcome,
    },
    /// Held in the review queue; the ledger was not touched
    Flagged(IngestOutcome),
}

#[derive(Clone)]
pub struct IngestionPipeline {
    stage: IngestionStage,
    ledger: PriceLedger,
}

impl IngestionPipeline {
    pub fn new(pool: PgPool, clock: SharedClock, matching: MatchingConfig) -> PipelineResult<Self> {
        let stage = IngestionStage::new(pool.clone(), clock.clone(), matching)?;
        let ledger = PriceLedger::new(pool, clock);
        Ok(Self { stage, ledger })
    }

    pub fn stage(&self) -> &IngestionStage {
        &self.stage
    }

    pub fn ledger(&self) -> &PriceLedger {
        &self.ledger
    }

    pub async fn ingest_and_apply(&self, record: StagingRecord) -> PipelineResult<PipelineOutcome> {
        match self.stage.ingest(record).await? {
            IngestOutcome::Resolved { observation, .. } => {
                let outcome = self.ledger.apply_observation(&observation).await?;
                Ok(PipelineOutcome::Applied { observation, outcome })
            }
            flagged => Ok(PipelineOutcome::Flagged(flagged)),
        }
    }

    /// Resolve a review item and apply the record it releases
    pub async fn resolve_review(
        &self,
        review_id: i64,
        decision: ReviewDecision,
        reviewed_by: &str,
    ) -> PipelineResult<Option<(ResolvedObservation, ApplyOutcome)>> {
        let Some(observation) = self.stage.resolve_review(review_id, decision, reviewed_by).await? else {
            return Ok(None);
        };
        let outcome = self.ledger.apply_observation(&observation).await?;
        Ok(Some((observation, outcome)))
    }
}
