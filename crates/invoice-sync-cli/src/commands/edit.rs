use std::time::Duration;

use anyhow::{Result, bail};
use invoice_sync::{
    Amount, DerivedAmounts, EditOutcome, ManualEdit, NaturalKey, RetryPolicy, SubjectId,
    SyncService,
};

pub async fn run(
    service: &SyncService,
    subject: &SubjectId,
    key: &NaturalKey,
    transferred: Option<Amount>,
    withheld: Option<Amount>,
) -> Result<()> {
    if transferred.is_none() && withheld.is_none() {
        bail!("nothing to edit: pass --transferred and/or --withheld");
    }

    let Some(current) = service.invoice(subject, key).await? else {
        bail!("invoice {key} not found for {subject}");
    };
    let derived = DerivedAmounts {
        transferred_taxes: transferred.unwrap_or(current.derived.transferred_taxes),
        withheld_taxes: withheld.unwrap_or(current.derived.withheld_taxes),
    };

    let editor = service.editor(RetryPolicy::default(), Duration::ZERO);
    let outcome = editor
        .apply(ManualEdit {
            subject_id: subject.clone(),
            natural_key: key.clone(),
            derived,
        })
        .await?;

    match outcome {
        EditOutcome::Persisted { invoice, attempts } => {
            println!(
                "Saved {key}: transferred {}, withheld {} ({attempts} attempt(s)).",
                invoice.derived.transferred_taxes, invoice.derived.withheld_taxes
            );
            Ok(())
        }
        EditOutcome::RolledBack {
            restored,
            attempts,
            error,
        } => bail!(
            "edit of {key} failed after {attempts} attempt(s): {error}; kept transferred {}, withheld {}",
            restored.transferred_taxes,
            restored.withheld_taxes
        ),
    }
}
