//! Ingestion stage and review queue integration tests

mod common;

use bigdecimal::BigDecimal;
use common::{listing, TestDb, SOURCE};
use pricewatch_core::config::MatchingConfig;
use pricewatch_core::ingest::{
    IngestOutcome, MatchMethod, PipelineOutcome, Resolution, ReviewDecision, ReviewReason, StagingRecord,
};
use pricewatch_core::ledger::ApplyOutcome;
use pricewatch_core::PipelineError;
use std::collections::HashSet;
use std::str::FromStr;

fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

async fn staging_count(db: &TestDb) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM staging_records")
        .fetch_one(&db.pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_same_article_resolves_to_same_entity() {
    let Some(db) = TestDb::connect().await else { return };
    let stage = db.pipeline().stage().clone();
    let now = common::epoch();

    let a = stage
        .ingest(listing("msk-1", "Дисплей iPhone 12 черный", "4 990 ₽", "5", now).with_article("GS-0012"))
        .await
        .unwrap();
    // Different outlet, different wording, same article modulo punctuation
    let b = stage
        .ingest(
            listing("spb-2", "Экран для Apple iPhone12 (black)", "5 100 ₽", "2", now).with_article("gs 0012"),
        )
        .await
        .unwrap();

    let a = a.observation().unwrap();
    let b = b.observation().unwrap();
    assert_eq!(a.entity.id, b.entity.id);
    assert_ne!(a.outlet.id, b.outlet.id);
    assert_eq!(b.price, dec("5100.00"));

    match stage
        .resolve(&listing("msk-1", "anything", "1", "1", now).with_article("GS0012"))
        .await
        .unwrap()
    {
        Resolution::Matched { entity, method, .. } => {
            assert_eq!(entity.id, a.entity.id);
            assert_eq!(method, MatchMethod::Article);
        }
        other => panic!("expected article match, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_article_ingest_creates_one_entity() {
    let Some(db) = TestDb::connect().await else { return };
    let stage = db.pipeline().stage().clone();
    let now = common::epoch();

    let mut handles = Vec::new();
    for n in 0..6 {
        let stage = stage.clone();
        handles.push(tokio::spawn(async move {
            let record = listing(&format!("outlet-{}", n), "Аккумулятор iPhone 11", "1 490", "в наличии", now)
                .with_article("APL-11-BAT");
            stage.ingest(record).await.unwrap()
        }));
    }

    let mut entities = HashSet::new();
    for handle in handles {
        entities.insert(handle.await.unwrap().observation().unwrap().entity.id);
    }
    assert_eq!(entities.len(), 1);
}

#[tokio::test]
async fn test_normalized_names_match_without_article() {
    let Some(db) = TestDb::connect().await else { return };
    let stage = db.pipeline().stage().clone();
    let now = common::epoch();

    let first = stage
        .ingest(listing("msk-1", "Дисплей для iPhone 12 (оригинал)", "4990", "3", now))
        .await
        .unwrap();
    let second = stage
        .ingest(listing("msk-2", "Дисплей iPhone 12 Оригинал", "4890", "1", now))
        .await
        .unwrap();

    match (&first, &second) {
        (
            IngestOutcome::Resolved { observation: a, method: None },
            IngestOutcome::Resolved {
                observation: b,
                method: Some(MatchMethod::Name),
            },
        ) => assert_eq!(a.entity.id, b.entity.id),
        other => panic!("expected create then name match, got {:?}", other),
    }
}

#[tokio::test]
async fn test_distinct_names_create_distinct_entities() {
    let Some(db) = TestDb::connect().await else { return };
    let stage = db.pipeline().stage().clone();
    let now = common::epoch();

    let names = [
        "Дисплей iPhone 12 черный",
        "Аккумулятор Samsung Galaxy S10",
        "Шлейф зарядки Xiaomi Redmi Note 8",
    ];
    let mut ids = HashSet::new();
    for name in names {
        let outcome = stage.ingest(listing("msk-1", name, "990", "1", now)).await.unwrap();
        match outcome {
            IngestOutcome::Resolved { observation, method: None } => {
                ids.insert(observation.entity.id);
            }
            other => panic!("expected a new entity for {}, got {:?}", name, other),
        }
    }
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn test_exact_name_found_beyond_candidate_limit() {
    let Some(db) = TestDb::connect().await else { return };
    let policy = MatchingConfig {
        candidate_limit: 3,
        ..MatchingConfig::default()
    };
    let stage = db.pipeline_with(policy).stage().clone();
    let now = common::epoch();

    // Older entities in the same category fill the candidate window
    for name in [
        "Аккумулятор Samsung Galaxy S10",
        "Шлейф зарядки Xiaomi Redmi Note 8",
        "Динамик Honor 9X",
        "Камера Huawei P30",
    ] {
        stage.ingest(listing("msk-1", name, "990", "1", now)).await.unwrap();
    }

    let mut ids = HashSet::new();
    for (n, outlet) in ["msk-1", "msk-2", "spb-1"].into_iter().enumerate() {
        let outcome = stage
            .ingest(listing(outlet, "Корпус Nokia 3310", "1490", "1", now))
            .await
            .unwrap();
        match outcome {
            IngestOutcome::Resolved { observation, method } => {
                let expected = if n == 0 { None } else { Some(MatchMethod::Name) };
                assert_eq!(method, expected, "ingest #{}", n);
                ids.insert(observation.entity.id);
            }
            other => panic!("expected resolution, got {:?}", other),
        }
    }
    assert_eq!(ids.len(), 1);

    let entities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nomenclature")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(entities, 5);
}

#[tokio::test]
async fn test_ambiguous_match_goes_to_review() {
    let Some(db) = TestDb::connect().await else { return };
    let pipeline = db.pipeline();
    let stage = pipeline.stage();
    let now = common::epoch();

    let black = stage
        .ingest(listing("msk-1", "Дисплей iPhone 12 черный", "4990", "1", now).with_article("D12-BLK"))
        .await
        .unwrap();
    let white = stage
        .ingest(listing("msk-1", "Дисплей iPhone 12 белый", "4990", "1", now).with_article("D12-WHT"))
        .await
        .unwrap();
    let black_id = black.observation().unwrap().entity.id;
    let white_id = white.observation().unwrap().entity.id;

    let outcome = pipeline
        .ingest_and_apply(listing("msk-1", "Дисплей iPhone 12", "4890", "2", now))
        .await
        .unwrap();
    let (staging_id, review_id, candidates) = match outcome {
        PipelineOutcome::Flagged(IngestOutcome::Ambiguous {
            staging_id,
            review_id,
            candidates,
        }) => (staging_id, review_id, candidates),
        other => panic!("expected ambiguous, got {:?}", other),
    };
    let candidate_ids: HashSet<_> = candidates.iter().map(|c| c.nomenclature_id).collect();
    assert_eq!(candidate_ids, HashSet::from([black_id, white_id]));

    // Staged but not resolved into the ledger
    let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM price_snapshots")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(snapshots, 0);

    let pending = stage.pending_reviews(Some(SOURCE), 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, review_id);
    assert_eq!(pending[0].staging_id, staging_id);
    assert_eq!(pending[0].reason, ReviewReason::AmbiguousMatch);
    assert_eq!(pending[0].candidates.len(), 2);

    // Operator merges into the black variant; the ledger gets its first price
    let (observation, applied) = pipeline
        .resolve_review(review_id, ReviewDecision::UseExisting(black_id), "tester")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observation.entity.id, black_id);
    assert_eq!(observation.staging_id, staging_id);
    assert_eq!(applied, ApplyOutcome::FirstSeen);

    assert!(stage.pending_reviews(Some(SOURCE), 10).await.unwrap().is_empty());
    let status: String = sqlx::query_scalar("SELECT status FROM staging_resolutions WHERE staging_id = $1")
        .bind(staging_id)
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(status, "reviewed");

    // Settled items cannot be settled again
    let err = pipeline
        .resolve_review(review_id, ReviewDecision::Dismiss, "tester")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidReview(_)));
}

#[tokio::test]
async fn test_review_create_new_entity() {
    let Some(db) = TestDb::connect().await else { return };
    let pipeline = db.pipeline();
    let stage = pipeline.stage();
    let now = common::epoch();

    for (name, article) in [("Дисплей iPhone 12 черный", "A1"), ("Дисплей iPhone 12 белый", "A2")] {
        stage
            .ingest(listing("msk-1", name, "4990", "1", now).with_article(article))
            .await
            .unwrap();
    }
    let outcome = stage
        .ingest(listing("msk-1", "Дисплей iPhone 12", "4890", "2", now))
        .await
        .unwrap();
    let IngestOutcome::Ambiguous { review_id, candidates, .. } = outcome else {
        panic!("expected ambiguous, got {:?}", outcome);
    };

    let (observation, _) = pipeline
        .resolve_review(review_id, ReviewDecision::CreateNew, "tester")
        .await
        .unwrap()
        .unwrap();
    assert!(candidates.iter().all(|c| c.nomenclature_id != observation.entity.id));
    assert_eq!(observation.entity.canonical_name, "Дисплей iPhone 12");
}

#[tokio::test]
async fn test_use_existing_rejects_foreign_entity() {
    let Some(db) = TestDb::connect().await else { return };
    let pipeline = db.pipeline();
    let stage = pipeline.stage();
    let now = common::epoch();

    let foreign = stage
        .ingest(
            StagingRecord::new("moba", "m-1", "Дисплей iPhone 12", "4990", "1", "https://moba.example/1", now)
                .with_article("X1"),
        )
        .await
        .unwrap();
    for (name, article) in [("Дисплей iPhone 12 черный", "A1"), ("Дисплей iPhone 12 белый", "A2")] {
        stage
            .ingest(listing("msk-1", name, "4990", "1", now).with_article(article))
            .await
            .unwrap();
    }
    let IngestOutcome::Ambiguous { review_id, .. } = stage
        .ingest(listing("msk-1", "Дисплей iPhone 12", "4890", "2", now))
        .await
        .unwrap()
    else {
        panic!("expected ambiguous");
    };

    let foreign_id = foreign.observation().unwrap().entity.id;
    let err = pipeline
        .resolve_review(review_id, ReviewDecision::UseExisting(foreign_id), "tester")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidReview(_)));

    let err = pipeline
        .resolve_review(review_id + 1000, ReviewDecision::Dismiss, "tester")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ReviewNotFound(_)));
}

#[tokio::test]
async fn test_malformed_record_stored_and_flagged() {
    let Some(db) = TestDb::connect().await else { return };
    let pipeline = db.pipeline();
    let now = common::epoch();

    let outcome = pipeline
        .ingest_and_apply(listing("msk-1", "Дисплей iPhone 12", "цена по запросу", "3", now))
        .await
        .unwrap();
    let PipelineOutcome::Flagged(IngestOutcome::Malformed { staging_id, review_id, reason }) = outcome else {
        panic!("expected malformed, got {:?}", outcome);
    };
    assert!(reason.contains("price"), "{}", reason);
    assert_eq!(staging_count(&db).await, 1);

    // Raw text survives, parsed columns stay empty
    let (raw_price, price): (String, Option<BigDecimal>) =
        sqlx::query_as("SELECT raw_price, price FROM staging_records WHERE id = $1")
            .bind(staging_id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(raw_price, "цена по запросу");
    assert!(price.is_none());

    // No entity was created
    let entities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nomenclature")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(entities, 0);

    let pending = pipeline.stage().pending_reviews(None, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].reason, ReviewReason::MalformedRecord);

    let err = pipeline
        .resolve_review(review_id, ReviewDecision::CreateNew, "tester")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidReview(_)));
    assert!(pipeline
        .resolve_review(review_id, ReviewDecision::Dismiss, "tester")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_oversized_price_is_malformed() {
    let Some(db) = TestDb::connect().await else { return };
    let stage = db.pipeline().stage().clone();

    let outcome = stage
        .ingest(listing("msk-1", "Дисплей iPhone 12", "999 999 999 999 999", "1", common::epoch()))
        .await
        .unwrap();
    let IngestOutcome::Malformed { staging_id, reason, .. } = outcome else {
        panic!("expected malformed, got {:?}", outcome);
    };
    assert!(reason.contains("price"), "{}", reason);

    let (raw_price, price): (String, Option<BigDecimal>) =
        sqlx::query_as("SELECT raw_price, price FROM staging_records WHERE id = $1")
            .bind(staging_id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(raw_price, "999 999 999 999 999");
    assert!(price.is_none());

    let pending = stage.pending_reviews(None, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].reason, ReviewReason::MalformedRecord);
}

#[tokio::test]
async fn test_negative_quantity_is_malformed() {
    let Some(db) = TestDb::connect().await else { return };
    let stage = db.pipeline().stage().clone();
    let outcome = stage
        .ingest(listing("msk-1", "Дисплей iPhone 12", "4990", "-2", common::epoch()))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Malformed { .. }));
}

#[tokio::test]
async fn test_staging_is_append_only() {
    let Some(db) = TestDb::connect().await else { return };
    let stage = db.pipeline().stage().clone();
    let outcome = stage
        .ingest(listing("msk-1", "Дисплей iPhone 12", "4990", "1", common::epoch()))
        .await
        .unwrap();

    let update = sqlx::query("UPDATE staging_records SET raw_price = '1' WHERE id = $1")
        .bind(outcome.staging_id())
        .execute(&db.pool)
        .await;
    assert!(update.is_err());

    // Re-ingesting the same record adds a row rather than touching the old one
    stage
        .ingest(listing("msk-1", "Дисплей iPhone 12", "4990", "1", common::epoch()))
        .await
        .unwrap();
    assert_eq!(staging_count(&db).await, 2);
}

#[tokio::test]
async fn test_register_outlet_upserts() {
    let Some(db) = TestDb::connect().await else { return };
    let stage = db.pipeline().stage().clone();

    let first = stage
        .register_outlet(SOURCE, "msk-1", Some("Москва"), None)
        .await
        .unwrap();
    let second = stage
        .register_outlet(SOURCE, "msk-1", None, Some("Центральный"))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.city.as_deref(), Some("Москва"));
    assert_eq!(second.region.as_deref(), Some("Центральный"));

    let other_source = stage.register_outlet("moba", "msk-1", None, None).await.unwrap();
    assert_ne!(other_source.id, first.id);
}
