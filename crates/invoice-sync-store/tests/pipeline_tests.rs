use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use invoice_sync::test_support::{
    CfdiFixture, SUBJECT, ScriptedClient, build_package, cfdi_document, verification,
};
use invoice_sync::{
    Amount, CfdiParser, ClientError, Collaborators, DedupStore, DerivedAmounts, Direction,
    ManualEdit, NaturalKey, RetryPolicy, ServiceSettings, StatusLabel, SubjectId, SyncError,
    SyncService, Throttle, WatermarkStore,
};
use invoice_sync_store::SqliteStore;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn subject() -> SubjectId {
    SubjectId::new(SUBJECT)
}

fn service_over(store: Arc<SqliteStore>, client: Arc<ScriptedClient>) -> SyncService {
    let deps = Collaborators {
        client,
        requests: store.clone(),
        packages: store.clone(),
        invoices: store.clone(),
        watermarks: store.clone(),
        audit: store,
        parser: Arc::new(CfdiParser),
    };
    SyncService::new(deps, ServiceSettings::default(), Throttle::unlimited())
}

fn package(uuids: &[&str], broken: usize) -> Vec<u8> {
    let mut entries: Vec<(String, Vec<u8>)> = uuids
        .iter()
        .map(|uuid| {
            let xml = cfdi_document(&CfdiFixture::issued(uuid));
            (format!("{uuid}.xml"), xml.into_bytes())
        })
        .collect();
    for n in 0..broken {
        entries.push((format!("broken-{n}.xml"), b"<cfdi:Comprobante".to_vec()));
    }

    let borrowed: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(name, content)| (name.as_str(), content.as_slice()))
        .collect();
    build_package(&borrowed)
}

#[tokio::test]
async fn sync_runs_end_to_end_on_sqlite() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let client = Arc::new(ScriptedClient::default());
    let service = service_over(store.clone(), client.clone());

    let created = service
        .create(&subject(), Direction::Issued, date(2025, 1, 1), date(2025, 1, 31))
        .await
        .unwrap();
    client.push_verification(Ok(verification("3", Some(&["P1", "P2"]))));
    client.add_package("P1", package(&["U-1", "U-2", "U-3"], 1));
    client.add_package("P2", package(&["U-3", "U-4"], 0));

    service.verify(&created.id).await.unwrap();
    service.download(&created.id).await.unwrap();
    let imported = service.import(&created.id).await.unwrap();

    assert_eq!(imported.counts.processed_count, 4);
    assert_eq!(imported.counts.existing_count, 1);
    assert_eq!(imported.counts.total_errors, 1);
    assert_eq!(
        service.status(&created.id).await.unwrap().label,
        StatusLabel::ProcessedWithErrors
    );

    let next = service
        .plan(&subject(), Direction::Issued, date(2025, 3, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.from, date(2025, 2, 1));
    assert_eq!(next.to, date(2025, 2, 28));

    let trail = service.audit_trail(&created.id).await.unwrap();
    assert_eq!(trail.len(), 4);
    assert!(trail.iter().all(|entry| entry.request_id.as_ref() == Some(&created.id)));
}

#[tokio::test]
async fn failed_download_keeps_range_open_on_sqlite() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let client = Arc::new(ScriptedClient::default());
    let service = service_over(store.clone(), client.clone());

    let created = service
        .create(&subject(), Direction::Issued, date(2025, 6, 1), date(2025, 6, 9))
        .await
        .unwrap();
    client.push_verification(Ok(verification("3", Some(&["P1", "P2", "P3"]))));
    client.add_package("P1", package(&["U-1", "U-2"], 0));
    client.fail_package("P2", ClientError::TransientNetwork("timed out".into()));
    client.add_package("P3", package(&["U-3"], 0));

    service.verify(&created.id).await.unwrap();
    let downloaded = service.download(&created.id).await.unwrap();
    assert!(downloaded.packages_downloaded);
    assert!(downloaded.stage_errors.download_error.is_some());

    let partial = service.import(&created.id).await.unwrap();
    assert_eq!(partial.counts.processed_count, 3);
    for key in ["u-1", "u-2", "u-3"] {
        assert!(store.exists(&subject(), &NaturalKey::new(key)).await.unwrap());
    }
    assert!(!partial.is_terminal());
    let watermark = WatermarkStore::get(store.as_ref(), &subject(), Direction::Issued).await;
    assert_eq!(watermark.unwrap(), None);
    assert_eq!(
        service
            .plan(&subject(), Direction::Issued, date(2025, 6, 20))
            .await
            .unwrap(),
        None
    );

    // Reloaded from disk, the request still asks for the missing package.
    let stored = service.request(&created.id).await.unwrap();
    assert!(!stored.packages_processed);
    assert!(stored.stage_errors.download_error.is_some());

    client.add_package("P2", package(&["U-4"], 0));
    service.download(&created.id).await.unwrap();
    let done = service.import(&created.id).await.unwrap();
    assert_eq!(done.counts.processed_count, 1);
    assert_eq!(done.counts.existing_count, 3);
    assert_eq!(
        service.status(&created.id).await.unwrap().label,
        StatusLabel::Processed
    );
    assert_eq!(
        WatermarkStore::get(store.as_ref(), &subject(), Direction::Issued).await.unwrap(),
        Some(date(2025, 6, 9))
    );
}

#[tokio::test]
async fn quota_holds_across_services_sharing_a_database() {
    let path = std::env::temp_dir()
        .join(format!("invoice-sync-{}", invoice_sync::RequestId::generate()))
        .join("sync.db");
    let client = Arc::new(ScriptedClient::default());

    let services: Vec<Arc<SyncService>> = (0..3)
        .map(|_| {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            Arc::new(service_over(store, client.clone()))
        })
        .collect();

    let handles: Vec<_> = services
        .iter()
        .enumerate()
        .map(|(n, service)| {
            let service = Arc::clone(service);
            let month = u32::try_from(n).unwrap() + 1;
            tokio::spawn(async move {
                service
                    .create(
                        &SubjectId::new(SUBJECT),
                        Direction::Received,
                        date(2024, month, 1),
                        date(2024, month, 28),
                    )
                    .await
            })
        })
        .collect();

    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => {}
            Err(SyncError::PolicyViolation { .. }) => refused += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(refused, 1);
    assert_eq!(services[0].list(None).await.unwrap().len(), 2);

    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[tokio::test]
async fn manual_edit_is_persisted_and_survives_reimport() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let client = Arc::new(ScriptedClient::default());
    let service = service_over(store.clone(), client.clone());

    let created = service
        .create(&subject(), Direction::Issued, date(2025, 1, 1), date(2025, 1, 31))
        .await
        .unwrap();
    client.push_verification(Ok(verification("3", Some(&["P1"]))));
    client.add_package("P1", package(&["U-1"], 0));
    service.verify(&created.id).await.unwrap();
    service.download(&created.id).await.unwrap();
    service.import(&created.id).await.unwrap();

    let key = NaturalKey::new("u-1");
    let edited = DerivedAmounts {
        transferred_taxes: Amount::from_cents(9_900),
        withheld_taxes: Amount::from_cents(100),
    };
    let outcome = service
        .editor(RetryPolicy::none(), Duration::from_millis(5))
        .apply(ManualEdit {
            subject_id: subject(),
            natural_key: key.clone(),
            derived: edited,
        })
        .await
        .unwrap();
    assert!(outcome.is_persisted());

    let again = service.import(&created.id).await.unwrap();
    assert_eq!(again.counts.existing_count, 1);

    let stored = service.invoice(&subject(), &key).await.unwrap().unwrap();
    assert!(stored.manually_modified);
    assert_eq!(stored.derived, edited);
    assert_eq!(stored.payload.total, Amount::from_cents(116_000));
}
