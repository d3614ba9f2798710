//! Ingestion, deduplication, and integrity behavior of the structured
//! store.

mod common;

use rust_decimal::Decimal;
use std::str::FromStr;
use sync_core::SyncError;
use uuid::Uuid;

use cfdi_engine::classify::ClassificationPolicy;
use cfdi_engine::models::{Direction, MovementKind};
use cfdi_engine::parser::parse_cfdi;
use cfdi_engine::services::{Anomaly, IngestOutcome};

use common::*;

#[tokio::test]
async fn ingest_creates_invoice_and_movement_once() {
    let dir = tempfile::tempdir().unwrap();
    let database = test_database(&dir).await;
    let company = database.create_company(COMPANY_RFC, "Acme").await.unwrap();

    let id = Uuid::new_v4();
    let parsed = parse_cfdi(&cfdi_xml(
        id, "I", COMPANY_RFC, OTHER_RFC, date(2024, 1, 5), "1500.00", Some("PUE"),
    ))
    .unwrap();

    let policy = ClassificationPolicy::default();
    let first = database
        .ingest(&company, &parsed, Direction::Issued, "ref", policy)
        .await
        .unwrap();
    assert_eq!(first, IngestOutcome::Created);

    let second = database
        .ingest(&company, &parsed, Direction::Issued, "ref", policy)
        .await
        .unwrap();
    assert_eq!(second, IngestOutcome::AlreadyExisted);

    let invoices = database.list_invoices(&company).await.unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].cfdi_uuid, id);
    assert_eq!(invoices[0].total, Decimal::from_str("1500.00").unwrap());

    let movements = database.list_movements(&company).await.unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].kind, MovementKind::Income);
    assert_eq!(movements[0].amount, Decimal::from_str("1500.00").unwrap());
    assert_eq!(movements[0].invoice_id, invoices[0].invoice_id);
    assert_eq!(movements[0].movement_date, date(2024, 1, 5));
}

#[tokio::test]
async fn concurrent_ingest_of_same_identifier_yields_one_invoice() {
    let dir = tempfile::tempdir().unwrap();
    let database = test_database(&dir).await;
    let company = database.create_company(COMPANY_RFC, "Acme").await.unwrap();

    let id = Uuid::new_v4();
    let parsed = parse_cfdi(&cfdi_xml(
        id, "I", COMPANY_RFC, OTHER_RFC, date(2024, 1, 8), "10.00", None,
    ))
    .unwrap();

    let policy = ClassificationPolicy::default();
    let (a, b) = tokio::join!(
        database.ingest(&company, &parsed, Direction::Issued, "ref", policy),
        database.ingest(&company, &parsed, Direction::Issued, "ref", policy),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert!(outcomes.contains(&IngestOutcome::Created));
    assert!(outcomes.contains(&IngestOutcome::AlreadyExisted));

    assert_eq!(database.list_invoices(&company).await.unwrap().len(), 1);
    assert_eq!(database.list_movements(&company).await.unwrap().len(), 1);
}

#[tokio::test]
async fn direction_flip_on_reingestion_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let database = test_database(&dir).await;
    let company = database.create_company(COMPANY_RFC, "Acme").await.unwrap();

    let id = Uuid::new_v4();
    let parsed = parse_cfdi(&cfdi_xml(
        id, "I", COMPANY_RFC, OTHER_RFC, date(2024, 2, 1), "5.00", None,
    ))
    .unwrap();

    let policy = ClassificationPolicy::default();
    database
        .ingest(&company, &parsed, Direction::Issued, "ref", policy)
        .await
        .unwrap();
    let err = database
        .ingest(&company, &parsed, Direction::Received, "ref", policy)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::DataIntegrity(_)));

    // The stored row is untouched.
    let invoice = database.get_invoice(&company, id).await.unwrap().unwrap();
    assert_eq!(invoice.direction, Direction::Issued);
}

#[tokio::test]
async fn payment_invoice_produces_no_movement_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let database = test_database(&dir).await;
    let company = database.create_company(COMPANY_RFC, "Acme").await.unwrap();

    let id = Uuid::new_v4();
    let parsed = parse_cfdi(&cfdi_xml(
        id, "P", COMPANY_RFC, OTHER_RFC, date(2024, 2, 10), "0", None,
    ))
    .unwrap();

    database
        .ingest(
            &company,
            &parsed,
            Direction::Issued,
            "ref",
            ClassificationPolicy::default(),
        )
        .await
        .unwrap();

    assert_eq!(database.list_invoices(&company).await.unwrap().len(), 1);
    assert!(database.list_movements(&company).await.unwrap().is_empty());
    // And it is not reported as an anomaly either.
    let anomalies = database
        .verify_integrity(&company, ClassificationPolicy::default())
        .await
        .unwrap();
    assert!(anomalies.is_empty());
}

#[tokio::test]
async fn reingestion_heals_a_lost_movement() {
    let dir = tempfile::tempdir().unwrap();
    let database = test_database(&dir).await;
    let company = database.create_company(COMPANY_RFC, "Acme").await.unwrap();

    let id = Uuid::new_v4();
    let parsed = parse_cfdi(&cfdi_xml(
        id, "I", COMPANY_RFC, OTHER_RFC, date(2024, 3, 3), "300.00", None,
    ))
    .unwrap();

    let policy = ClassificationPolicy::default();
    database
        .ingest(&company, &parsed, Direction::Issued, "ref", policy)
        .await
        .unwrap();

    sqlx::query("DELETE FROM movements WHERE company_id = ?")
        .bind(company.company_id)
        .execute(database.pool())
        .await
        .unwrap();

    let outcome = database
        .ingest(&company, &parsed, Direction::Issued, "ref", policy)
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::AlreadyExisted);
    assert_eq!(database.list_movements(&company).await.unwrap().len(), 1);
}

#[tokio::test]
async fn verify_reports_and_repair_fixes_missing_movements() {
    let dir = tempfile::tempdir().unwrap();
    let database = test_database(&dir).await;
    let company = database.create_company(COMPANY_RFC, "Acme").await.unwrap();

    let policy = ClassificationPolicy::default();
    let id = Uuid::new_v4();
    let parsed = parse_cfdi(&cfdi_xml(
        id, "I", COMPANY_RFC, OTHER_RFC, date(2024, 4, 4), "80.00", None,
    ))
    .unwrap();
    database
        .ingest(&company, &parsed, Direction::Issued, "ref", policy)
        .await
        .unwrap();

    sqlx::query("DELETE FROM movements WHERE company_id = ?")
        .bind(company.company_id)
        .execute(database.pool())
        .await
        .unwrap();

    let anomalies = database.verify_integrity(&company, policy).await.unwrap();
    assert_eq!(anomalies, vec![Anomaly::MissingMovement { cfdi_uuid: id }]);

    let created = database
        .create_missing_movements(&company, policy)
        .await
        .unwrap();
    assert_eq!(created, 1);

    assert!(database
        .verify_integrity(&company, policy)
        .await
        .unwrap()
        .is_empty());
    let movements = database.list_movements(&company).await.unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].amount, Decimal::from_str("80.00").unwrap());
}

#[tokio::test]
async fn refresh_updates_descriptive_fields_only() {
    let dir = tempfile::tempdir().unwrap();
    let database = test_database(&dir).await;
    let company = database.create_company(COMPANY_RFC, "Acme").await.unwrap();

    let id = Uuid::new_v4();
    let parsed = parse_cfdi(&cfdi_xml(
        id, "I", COMPANY_RFC, OTHER_RFC, date(2024, 5, 5), "100.00", None,
    ))
    .unwrap();
    database
        .ingest(
            &company,
            &parsed,
            Direction::Issued,
            "ref",
            ClassificationPolicy::default(),
        )
        .await
        .unwrap();

    let reparsed = parse_cfdi(&cfdi_xml(
        id, "I", COMPANY_RFC, OTHER_RFC, date(2024, 5, 5), "120.00", Some("PUE"),
    ))
    .unwrap();
    let updated = database
        .refresh_invoice_fields(&company, &reparsed)
        .await
        .unwrap();
    assert!(updated);

    let invoice = database.get_invoice(&company, id).await.unwrap().unwrap();
    assert_eq!(invoice.total, Decimal::from_str("120.00").unwrap());
    assert_eq!(invoice.payment_method.as_deref(), Some("PUE"));
    assert_eq!(invoice.direction, Direction::Issued);
    assert_eq!(invoice.cfdi_uuid, id);

    // Unknown folio refreshes nothing.
    let stranger = parse_cfdi(&cfdi_xml(
        Uuid::new_v4(), "I", COMPANY_RFC, OTHER_RFC, date(2024, 5, 6), "1.00", None,
    ))
    .unwrap();
    assert!(!database
        .refresh_invoice_fields(&company, &stranger)
        .await
        .unwrap());
}

#[tokio::test]
async fn duplicate_company_registration_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let database = test_database(&dir).await;
    database.create_company(COMPANY_RFC, "Acme").await.unwrap();

    let err = database
        .create_company(COMPANY_RFC, "Acme again")
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::DataIntegrity(_)));
}

#[tokio::test]
async fn same_folio_for_two_companies_is_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let database = test_database(&dir).await;
    let acme = database.create_company(COMPANY_RFC, "Acme").await.unwrap();
    let other = database.create_company(OTHER_RFC, "Other").await.unwrap();

    let id = Uuid::new_v4();
    let policy = ClassificationPolicy::default();
    let issued = parse_cfdi(&cfdi_xml(
        id, "I", COMPANY_RFC, OTHER_RFC, date(2024, 6, 6), "40.00", None,
    ))
    .unwrap();

    database
        .ingest(&acme, &issued, Direction::Issued, "ref", policy)
        .await
        .unwrap();
    // The counterparty ingests the same document as received.
    database
        .ingest(&other, &issued, Direction::Received, "ref", policy)
        .await
        .unwrap();

    assert_eq!(database.list_invoices(&acme).await.unwrap().len(), 1);
    assert_eq!(database.list_invoices(&other).await.unwrap().len(), 1);
}
