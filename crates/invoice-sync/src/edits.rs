use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::audit::{self, AuditEntry, AuditLevel, AuditLog, Stage};
use crate::debounce::Debouncer;
use crate::error::{RepositoryError, SyncError};
use crate::invoice::{DerivedAmounts, NaturalKey, ParsedInvoice};
use crate::repository::DedupStore;
use crate::request::SubjectId;
use crate::retry::RetryPolicy;

type InvoiceKey = (SubjectId, NaturalKey);

/// A user override of an invoice's derived amounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualEdit {
    pub subject_id: SubjectId,
    pub natural_key: NaturalKey,
    pub derived: DerivedAmounts,
}

/// How an edit ended. Never ambiguous: the write either landed or the local
/// view was restored.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    Persisted {
        invoice: ParsedInvoice,
        attempts: u32,
    },
    RolledBack {
        restored: DerivedAmounts,
        attempts: u32,
        error: RepositoryError,
    },
}

impl EditOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalValue {
    confirmed: DerivedAmounts,
    current: DerivedAmounts,
}

struct EditorInner {
    store: Arc<dyn DedupStore>,
    audit: Arc<dyn AuditLog>,
    retry: RetryPolicy,
    view: Mutex<HashMap<InvoiceKey, LocalValue>>,
}

/// Applies manual edits optimistically and reconciles them with the store.
pub struct ManualEditor {
    inner: Arc<EditorInner>,
    delay: Duration,
    /// One debouncer per invoice with a scheduled edit; dropped once idle.
    debouncers: Arc<Mutex<HashMap<InvoiceKey, Arc<Debouncer>>>>,
}

impl ManualEditor {
    pub fn new(
        store: Arc<dyn DedupStore>,
        audit: Arc<dyn AuditLog>,
        retry: RetryPolicy,
        delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EditorInner {
                store,
                audit,
                retry,
                view: Mutex::new(HashMap::new()),
            }),
            delay,
            debouncers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The value the editor currently shows for an invoice, if it has
    /// seen one.
    pub fn view(&self, subject: &SubjectId, key: &NaturalKey) -> Option<DerivedAmounts> {
        self.inner
            .view
            .lock()
            .ok()?
            .get(&(subject.clone(), key.clone()))
            .map(|value| value.current)
    }

    /// Apply an edit now: update the local view, then persist it.
    pub async fn apply(&self, edit: ManualEdit) -> Result<EditOutcome, SyncError> {
        self.inner.apply(edit).await
    }

    /// Coalesce rapid edits of the same invoice; only the last one inside
    /// the quiet period is applied. The handle yields `None` when the edit
    /// was superseded.
    pub fn schedule(&self, edit: ManualEdit) -> JoinHandle<Option<Result<EditOutcome, SyncError>>> {
        let key = (edit.subject_id.clone(), edit.natural_key.clone());
        let inner = Arc::clone(&self.inner);

        // Triggered under the lock so the idle hook never removes a
        // debouncer that has just been handed a new edit.
        let mut debouncers = self.debouncers.lock().unwrap_or_else(PoisonError::into_inner);
        let debouncer = debouncers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(self.idle_tracked(key)));
        debouncer.trigger(async move { inner.apply(edit).await })
    }

    /// Invoices with a scheduled edit still pending.
    pub fn scheduled(&self) -> usize {
        self.debouncers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn idle_tracked(&self, key: InvoiceKey) -> Debouncer {
        let registry = Arc::downgrade(&self.debouncers);
        Debouncer::new(self.delay).on_idle(move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut debouncers = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if debouncers.get(&key).is_some_and(|d| d.pending() == 0) {
                debouncers.remove(&key);
            }
        })
    }
}

impl EditorInner {
    async fn apply(&self, edit: ManualEdit) -> Result<EditOutcome, SyncError> {
        let key = (edit.subject_id.clone(), edit.natural_key.clone());

        let confirmed = match self.local(&key) {
            Some(value) => value.confirmed,
            None => {
                let stored = self
                    .store
                    .get(&edit.subject_id, &edit.natural_key)
                    .await?
                    .ok_or_else(|| {
                        RepositoryError::NotFound(format!(
                            "invoice {} of {}",
                            edit.natural_key, edit.subject_id
                        ))
                    })?;
                stored.derived
            }
        };

        self.set_local(
            &key,
            LocalValue {
                confirmed,
                current: edit.derived,
            },
        );

        let store = self.store.as_ref();
        let target = &edit;
        let (result, attempts) = self
            .retry
            .run_while(
                move |_| {
                    store.apply_manual_edit(&target.subject_id, &target.natural_key, target.derived)
                },
                |e| !matches!(e, RepositoryError::NotFound(_)),
            )
            .await;

        match result {
            Ok(invoice) => {
                self.set_local(
                    &key,
                    LocalValue {
                        confirmed: invoice.derived,
                        current: invoice.derived,
                    },
                );
                let entry = AuditEntry::new(
                    edit.subject_id.clone(),
                    Stage::Edit,
                    AuditLevel::Info,
                    format!("invoice {} edited manually", edit.natural_key),
                )
                .with_details(serde_json::json!({
                    "natural_key": edit.natural_key,
                    "derived": invoice.derived,
                    "attempts": attempts,
                }));
                audit::record(self.audit.as_ref(), entry).await;

                Ok(EditOutcome::Persisted { invoice, attempts })
            }
            Err(error) => {
                self.set_local(
                    &key,
                    LocalValue {
                        confirmed,
                        current: confirmed,
                    },
                );
                let entry = AuditEntry::new(
                    edit.subject_id.clone(),
                    Stage::Edit,
                    AuditLevel::Error,
                    format!(
                        "edit of invoice {} rolled back after {attempts} attempts: {error}",
                        edit.natural_key
                    ),
                );
                audit::record(self.audit.as_ref(), entry).await;

                Ok(EditOutcome::RolledBack {
                    restored: confirmed,
                    attempts,
                    error,
                })
            }
        }
    }

    fn local(&self, key: &InvoiceKey) -> Option<LocalValue> {
        self.view.lock().ok()?.get(key).copied()
    }

    fn set_local(&self, key: &InvoiceKey, value: LocalValue) {
        if let Ok(mut view) = self.view.lock() {
            view.insert(key.clone(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::Amount;
    use crate::test_support::{InMemoryAudit, InMemoryInvoices, invoice};

    fn amounts(transferred: i64) -> DerivedAmounts {
        DerivedAmounts {
            transferred_taxes: Amount::from_cents(transferred),
            withheld_taxes: Amount::ZERO,
        }
    }

    fn editor(store: &Arc<InMemoryInvoices>, retry: RetryPolicy) -> ManualEditor {
        ManualEditor::new(
            store.clone(),
            Arc::new(InMemoryAudit::default()),
            retry,
            Duration::from_millis(50),
        )
    }

    fn edit(derived: DerivedAmounts) -> ManualEdit {
        ManualEdit {
            subject_id: SubjectId::new("AAA010101AAA"),
            natural_key: NaturalKey::new("K1"),
            derived,
        }
    }

    async fn seeded_store() -> Arc<InMemoryInvoices> {
        let store = Arc::new(InMemoryInvoices::default());
        store.save(&invoice("AAA010101AAA", "K1")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn persisted_edit_flags_invoice() {
        let store = seeded_store().await;
        let editor = editor(&store, RetryPolicy::none());

        let outcome = editor.apply(edit(amounts(999))).await.unwrap();
        assert!(outcome.is_persisted());

        let stored = store
            .get(&SubjectId::new("AAA010101AAA"), &NaturalKey::new("K1"))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.manually_modified);
        assert_eq!(stored.derived, amounts(999));
        assert_eq!(
            editor.view(&SubjectId::new("AAA010101AAA"), &NaturalKey::new("K1")),
            Some(amounts(999))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let store = seeded_store().await;
        store.fail_next_edits(2);
        let editor = editor(&store, RetryPolicy::default());

        let outcome = editor.apply(edit(amounts(500))).await.unwrap();
        match outcome {
            EditOutcome::Persisted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected persisted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_rolls_back_local_view() {
        let store = seeded_store().await;
        store.fail_next_edits(10);
        let editor = editor(&store, RetryPolicy::default());
        let original = invoice("AAA010101AAA", "K1").derived;

        let outcome = editor.apply(edit(amounts(1))).await.unwrap();
        match outcome {
            EditOutcome::RolledBack {
                restored, attempts, ..
            } => {
                assert_eq!(restored, original);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected rollback, got {other:?}"),
        }

        assert_eq!(
            editor.view(&SubjectId::new("AAA010101AAA"), &NaturalKey::new("K1")),
            Some(original)
        );
        let stored = store
            .get(&SubjectId::new("AAA010101AAA"), &NaturalKey::new("K1"))
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.manually_modified);
    }

    #[tokio::test]
    async fn unknown_invoice_is_not_found() {
        let store = Arc::new(InMemoryInvoices::default());
        let editor = editor(&store, RetryPolicy::none());

        let result = editor.apply(edit(amounts(1))).await;
        assert!(matches!(
            result,
            Err(SyncError::Storage(RepositoryError::NotFound(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_edits_are_coalesced() {
        let store = seeded_store().await;
        let editor = editor(&store, RetryPolicy::none());

        let first = editor.schedule(edit(amounts(100)));
        let second = editor.schedule(edit(amounts(200)));
        let third = editor.schedule(edit(amounts(300)));

        assert!(first.await.unwrap().is_none());
        assert!(second.await.unwrap().is_none());
        let outcome = third.await.unwrap().unwrap().unwrap();
        assert!(outcome.is_persisted());

        assert_eq!(store.edit_calls(), 1);
        assert_eq!(editor.scheduled(), 0);
        let stored = store
            .get(&SubjectId::new("AAA010101AAA"), &NaturalKey::new("K1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.derived, amounts(300));
    }

    #[tokio::test(start_paused = true)]
    async fn settled_invoices_are_forgotten() {
        let store = seeded_store().await;
        store.save(&invoice("AAA010101AAA", "K2")).await.unwrap();
        let editor = editor(&store, RetryPolicy::none());

        let first = editor.schedule(edit(amounts(100)));
        let mut other = edit(amounts(200));
        other.natural_key = NaturalKey::new("K2");
        let second = editor.schedule(other);
        assert_eq!(editor.scheduled(), 2);

        assert!(first.await.unwrap().unwrap().unwrap().is_persisted());
        assert!(second.await.unwrap().unwrap().unwrap().is_persisted());
        assert_eq!(editor.scheduled(), 0);

        let again = editor.schedule(edit(amounts(300)));
        assert_eq!(editor.scheduled(), 1);
        assert!(again.await.unwrap().unwrap().unwrap().is_persisted());
        assert_eq!(editor.scheduled(), 0);
    }
}
