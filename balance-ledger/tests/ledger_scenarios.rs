//! End-to-end scenarios against a file-backed store

use balance_ledger::{
    Config, EntryKind, Error, Ledger, PostRequest, RebuildScope, Reference, ReservationStatus,
    ReserveRequest, SubjectId, TenantId, TransferRequest,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tempfile::TempDir;

fn test_config() -> (Config, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.database_url = format!("sqlite://{}", temp_dir.path().join("ledger.db").display());
    (config, temp_dir)
}

async fn create_test_ledger() -> (Ledger, TempDir) {
    let (config, temp_dir) = test_config();
    (Ledger::open(config).await.unwrap(), temp_dir)
}

fn tenant() -> TenantId {
    TenantId::new("acme")
}

fn receipt(subject: &SubjectId, qty: Decimal, event: &str) -> PostRequest {
    PostRequest::new(
        tenant(),
        subject.clone(),
        EntryKind::Receipt,
        qty,
        Reference::PurchaseReceipt {
            receipt_id: event.to_string(),
        },
    )
    .with_source_event(event)
}

fn consumption(subject: &SubjectId, qty: Decimal) -> PostRequest {
    PostRequest::new(
        tenant(),
        subject.clone(),
        EntryKind::Consumption,
        qty,
        Reference::SalesShipment {
            order_id: "SO-DIRECT".to_string(),
        },
    )
}

#[tokio::test]
async fn test_reserve_fulfil_deplete_corrupt_rebuild() {
    let (ledger, _temp) = create_test_ledger().await;
    let subject = SubjectId::stock("WH1", "ITEM42");

    ledger.post(receipt(&subject, dec!(100), "rcv-1")).await.unwrap();
    assert_eq!(ledger.get_balance(&tenant(), &subject).await.unwrap(), dec!(100));

    let reservation = ledger
        .reserve(ReserveRequest {
            tenant: tenant(),
            subject: subject.clone(),
            quantity: dec!(30),
            source_document_id: "SO-1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(ledger.get_available(&tenant(), &subject).await.unwrap(), dec!(70));

    ledger
        .fulfill_reservation(&tenant(), reservation.id, dec!(25))
        .await
        .unwrap();
    assert_eq!(ledger.get_balance(&tenant(), &subject).await.unwrap(), dec!(75));
    assert_eq!(ledger.get_available(&tenant(), &subject).await.unwrap(), dec!(75));
    assert_eq!(
        ledger
            .get_reservation(&tenant(), reservation.id)
            .await
            .unwrap()
            .status,
        ReservationStatus::Consumed
    );

    let err = ledger.post(consumption(&subject, dec!(80))).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { .. }));
    assert!(err.is_client_error());
    assert_eq!(ledger.get_balance(&tenant(), &subject).await.unwrap(), dec!(75));

    assert!(ledger
        .find_discrepancies(&tenant(), Decimal::ZERO)
        .await
        .unwrap()
        .is_empty());

    sqlx::query(
        "UPDATE balance_cache SET cached_balance = '999' WHERE tenant_id = ?1 AND subject_id = ?2",
    )
    .bind(tenant().as_str())
    .bind(subject.key())
    .execute(ledger.storage().pool())
    .await
    .unwrap();

    let rebuilt = ledger.rebuild(&tenant(), &subject, true).await.unwrap();
    assert_eq!(rebuilt.previous, dec!(999));
    assert_eq!(rebuilt.computed, dec!(75));
    assert_eq!(rebuilt.difference, dec!(-924));
    assert!(rebuilt.updated);
    assert_eq!(ledger.get_balance(&tenant(), &subject).await.unwrap(), dec!(75));
}

#[tokio::test]
async fn test_failed_transfer_commits_nothing() {
    let (ledger, _temp) = create_test_ledger().await;
    let from = SubjectId::stock("WH1", "ITEM42");
    let to = SubjectId::stock("WH2", "ITEM42");
    ledger.post(receipt(&from, dec!(5), "rcv-1")).await.unwrap();

    let err = ledger
        .transfer(TransferRequest {
            tenant: tenant(),
            from: from.clone(),
            to: to.clone(),
            quantity: dec!(6),
            transfer_id: "TR-1".to_string(),
            actor: "clerk".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { .. }));

    assert_eq!(
        ledger.entries_for_subject(&tenant(), &from).await.unwrap().len(),
        1
    );
    assert!(ledger
        .entries_for_subject(&tenant(), &to)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(ledger.get_balance(&tenant(), &to).await.unwrap(), dec!(0));
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let (ledger, _temp) = create_test_ledger().await;
    let subject = SubjectId::account("CUST7");

    ledger
        .post(PostRequest::new(
            TenantId::new("a"),
            subject.clone(),
            EntryKind::Invoice,
            dec!(10),
            Reference::CustomerInvoice {
                invoice_id: "INV-1".to_string(),
            },
        ))
        .await
        .unwrap();

    assert_eq!(
        ledger
            .get_balance(&TenantId::new("b"), &subject)
            .await
            .unwrap(),
        dec!(0)
    );
    assert!(ledger
        .entries_for_subject(&TenantId::new("b"), &subject)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_depletions_never_oversell() {
    let (ledger, _temp) = create_test_ledger().await;
    let ledger = Arc::new(ledger);
    let subject = SubjectId::stock("WH1", "ITEM42");
    ledger.post(receipt(&subject, dec!(100), "rcv-1")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..25 {
        let ledger = ledger.clone();
        let subject = subject.clone();
        handles.push(tokio::spawn(async move {
            ledger.post(consumption(&subject, dec!(10))).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(Error::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(ledger.get_balance(&tenant(), &subject).await.unwrap(), dec!(0));
    assert_eq!(
        ledger.compute_true_balance(&tenant(), &subject).await.unwrap(),
        (dec!(0), 11)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replays_post_once() {
    let (ledger, _temp) = create_test_ledger().await;
    let ledger = Arc::new(ledger);
    let subject = SubjectId::stock("WH1", "ITEM42");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        let subject = subject.clone();
        handles.push(tokio::spawn(async move {
            ledger.post(receipt(&subject, dec!(7), "return-123-item-45")).await
        }));
    }

    let mut fresh = 0;
    for handle in handles {
        if !handle.await.unwrap().unwrap().replayed {
            fresh += 1;
        }
    }

    assert_eq!(fresh, 1);
    assert_eq!(ledger.get_balance(&tenant(), &subject).await.unwrap(), dec!(7));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_transfers_conserve_stock() {
    let (ledger, _temp) = create_test_ledger().await;
    let ledger = Arc::new(ledger);
    let a = SubjectId::stock("WH1", "ITEM42");
    let b = SubjectId::stock("WH2", "ITEM42");
    ledger.post(receipt(&a, dec!(50), "rcv-a")).await.unwrap();
    ledger.post(receipt(&b, dec!(50), "rcv-b")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let ledger = ledger.clone();
        let (from, to) = if i % 2 == 0 {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        handles.push(tokio::spawn(async move {
            ledger
                .transfer(TransferRequest {
                    tenant: tenant(),
                    from,
                    to,
                    quantity: dec!(3),
                    transfer_id: format!("TR-{}", i),
                    actor: "clerk".to_string(),
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let total = ledger.get_balance(&tenant(), &a).await.unwrap()
        + ledger.get_balance(&tenant(), &b).await.unwrap();
    assert_eq!(total, dec!(100));
    assert!(ledger
        .find_discrepancies(&tenant(), Decimal::ZERO)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_instances_on_one_file_post_event_once() {
    let (config, _temp) = test_config();
    let first = Arc::new(Ledger::open(config.clone()).await.unwrap());
    let second = Arc::new(Ledger::open(config).await.unwrap());
    let subject = SubjectId::stock("WH1", "ITEM42");

    let mut handles = Vec::new();
    for i in 0..20 {
        let ledger = if i % 2 == 0 { first.clone() } else { second.clone() };
        let subject = subject.clone();
        handles.push(tokio::spawn(async move {
            ledger.post(receipt(&subject, dec!(7), "rcv-shared")).await
        }));
    }

    let mut fresh = Vec::new();
    for handle in handles {
        let posted = handle.await.unwrap().unwrap();
        if !posted.replayed {
            fresh.push(posted.entry.id);
        }
    }

    assert_eq!(fresh.len(), 1);
    assert_eq!(first.get_balance(&tenant(), &subject).await.unwrap(), dec!(7));
    assert_eq!(second.get_balance(&tenant(), &subject).await.unwrap(), dec!(7));
    assert_eq!(
        second.compute_true_balance(&tenant(), &subject).await.unwrap(),
        (dec!(7), 1)
    );
    assert!(first
        .find_discrepancies(&tenant(), Decimal::ZERO)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_committing_rebuild_during_posts_rewrites_nothing() {
    let (ledger, _temp) = create_test_ledger().await;
    let ledger = Arc::new(ledger);
    let subjects: Vec<SubjectId> = (0..4)
        .map(|i| SubjectId::stock("WH1", format!("ITEM{}", i)))
        .collect();
    for subject in &subjects {
        ledger
            .post(receipt(subject, dec!(100), &format!("opening-{}", subject)))
            .await
            .unwrap();
    }

    let rebuilder = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            for _ in 0..15 {
                let batch = ledger
                    .rebuild_batch(&tenant(), RebuildScope::All, true, true)
                    .await
                    .unwrap();
                assert_eq!(batch.subjects_scanned, 4);
                assert_eq!(batch.subjects_updated, 0);
                assert!(batch.results.is_empty());
                assert!(batch.unresolved.is_empty());
                tokio::task::yield_now().await;
            }
        })
    };

    // per subject: 5 receipts of 2 and 10 consumptions of 1
    let mut handles = Vec::new();
    for i in 0..60 {
        let ledger = ledger.clone();
        let subject = subjects[i % 4].clone();
        handles.push(tokio::spawn(async move {
            let request = if i % 3 == 0 {
                receipt(&subject, dec!(2), &format!("rcv-{}", i))
            } else {
                consumption(&subject, dec!(1))
            };
            ledger.post(request).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    rebuilder.await.unwrap();

    for subject in &subjects {
        assert_eq!(ledger.get_balance(&tenant(), subject).await.unwrap(), dec!(100));
    }
    assert!(ledger
        .find_discrepancies(&tenant(), Decimal::ZERO)
        .await
        .unwrap()
        .is_empty());
}
