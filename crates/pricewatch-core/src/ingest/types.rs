//! Ingestion model

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Raw listing as produced by a source adapter
///
/// Values are kept exactly as scraped; numeric fields are parsed during
/// ingestion and the raw strings are stored alongside the parsed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub source_id: String,
    pub outlet_code: String,
    pub name: String,
    pub article: Option<String>,
    pub category_path: Vec<String>,
    pub brand: Option<String>,
    pub price: String,
    pub old_price: Option<String>,
    pub quantity: String,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
}

impl StagingRecord {
    pub fn new(
        source_id: impl Into<String>,
        outlet_code: impl Into<String>,
        name: impl Into<String>,
        price: impl Into<String>,
        quantity: impl Into<String>,
        url: impl Into<String>,
        scraped_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            outlet_code: outlet_code.into(),
            name: name.into(),
            article: None,
            category_path: Vec::new(),
            brand: None,
            price: price.into(),
            old_price: None,
            quantity: quantity.into(),
            url: url.into(),
            scraped_at,
        }
    }

    pub fn with_article(mut self, article: impl Into<String>) -> Self {
        self.article = Some(article.into());
        self
    }

    pub fn with_category<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.category_path = path.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub fn with_old_price(mut self, old_price: impl Into<String>) -> Self {
        self.old_price = Some(old_price.into());
        self
    }
}

/// Numeric fields of a listing after parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedListing {
    pub price: BigDecimal,
    pub old_price: Option<BigDecimal>,
    pub quantity: i32,
}

/// Stock location tied to a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Outlet {
    pub id: i64,
    pub source_id: String,
    pub code: String,
    pub city: Option<String>,
    pub region: Option<String>,
}

/// Canonical product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct NomenclatureEntity {
    pub id: i64,
    pub source_id: String,
    pub canonical_name: String,
    pub normalized_name: String,
    pub article: Option<String>,
    pub normalized_article: Option<String>,
    pub brand: Option<String>,
    pub category_path: Vec<String>,
    pub category_key: String,
    pub created_at: DateTime<Utc>,
}

/// How a record was tied to its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Article,
    Name,
}

/// Existing entity scored against an incoming record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub nomenclature_id: i64,
    pub canonical_name: String,
    pub score: f64,
}

/// Outcome of matching one record against the catalog
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Matched {
        entity: NomenclatureEntity,
        method: MatchMethod,
        score: f64,
    },
    Created(NomenclatureEntity),
    /// Not confident enough to merge; goes to the review queue
    Ambiguous(Vec<ScoredCandidate>),
}

impl Resolution {
    pub fn entity(&self) -> Option<&NomenclatureEntity> {
        match self {
            Resolution::Matched { entity, .. } | Resolution::Created(entity) => Some(entity),
            Resolution::Ambiguous(_) => None,
        }
    }
}

/// Resolved observation handed to the price ledger
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedObservation {
    pub staging_id: i64,
    pub entity: NomenclatureEntity,
    pub outlet: Outlet,
    pub price: BigDecimal,
    pub old_price: Option<BigDecimal>,
    pub quantity: i32,
    pub observed_at: DateTime<Utc>,
}

/// What `ingest` did with a record
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Resolved {
        observation: ResolvedObservation,
        /// `None` when a new entity was created
        method: Option<MatchMethod>,
    },
    Ambiguous {
        staging_id: i64,
        review_id: i64,
        candidates: Vec<ScoredCandidate>,
    },
    Malformed {
        staging_id: i64,
        review_id: i64,
        reason: String,
    },
}

impl IngestOutcome {
    pub fn staging_id(&self) -> i64 {
        match self {
            IngestOutcome::Resolved { observation, .. } => observation.staging_id,
            IngestOutcome::Ambiguous { staging_id, .. } | IngestOutcome::Malformed { staging_id, .. } => {
                *staging_id
            }
        }
    }

    pub fn observation(&self) -> Option<&ResolvedObservation> {
        match self {
            IngestOutcome::Resolved { observation, .. } => Some(observation),
            _ => None,
        }
    }
}
