//! Ingestion stage
//!
//! Raw listings from source adapters are appended to staging, parsed, and
//! resolved to canonical nomenclature. Anything the stage cannot resolve
//! with confidence becomes a review-queue row instead of a guess.

pub mod matcher;
pub mod normalize;
pub mod parse;
pub mod pipeline;
pub mod review;
pub mod stage;
pub mod types;

pub use pipeline::{IngestionPipeline, PipelineOutcome};
pub use review::{ReviewDecision, ReviewItem, ReviewReason};
pub use stage::IngestionStage;
pub use types::{
    IngestOutcome, MatchMethod, NomenclatureEntity, Outlet, ParsedListing, Resolution,
    ResolvedObservation, ScoredCandidate, StagingRecord,
};
