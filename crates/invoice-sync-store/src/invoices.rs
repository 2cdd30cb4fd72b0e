use chrono::Utc;
use invoice_sync::{
    Amount, DedupStore, DerivedAmounts, InvoicePayload, NaturalKey, ParsedInvoice,
    RepositoryError, SaveOutcome, SubjectId,
};
use rusqlite::OptionalExtension;

use crate::store::{SqliteStore, corrupt, db_error, format_timestamp, parse_direction};

struct InvoiceRow {
    subject_id: String,
    natural_key: String,
    direction: String,
    payload_json: String,
    transferred_taxes: i64,
    withheld_taxes: i64,
    manually_modified: bool,
}

impl InvoiceRow {
    fn read(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            subject_id: row.get(0)?,
            natural_key: row.get(1)?,
            direction: row.get(2)?,
            payload_json: row.get(3)?,
            transferred_taxes: row.get(4)?,
            withheld_taxes: row.get(5)?,
            manually_modified: row.get(6)?,
        })
    }

    fn into_invoice(self) -> Result<ParsedInvoice, RepositoryError> {
        let key = self.natural_key.as_str();
        let payload: InvoicePayload = serde_json::from_str(&self.payload_json)
            .map_err(|e| corrupt(key, format!("bad payload: {e}")))?;

        Ok(ParsedInvoice {
            direction: parse_direction(key, &self.direction)?,
            natural_key: NaturalKey::new(key),
            subject_id: SubjectId::new(&self.subject_id),
            payload,
            derived: DerivedAmounts {
                transferred_taxes: Amount::from_cents(self.transferred_taxes),
                withheld_taxes: Amount::from_cents(self.withheld_taxes),
            },
            manually_modified: self.manually_modified,
        })
    }
}

fn select(
    conn: &rusqlite::Connection,
    subject: &SubjectId,
    key: &NaturalKey,
) -> Result<Option<ParsedInvoice>, RepositoryError> {
    conn.query_row(
        "SELECT subject_id, natural_key, direction, payload_json, transferred_taxes,
                withheld_taxes, manually_modified
         FROM invoices WHERE subject_id = ?1 AND natural_key = ?2",
        [subject.as_str(), key.as_str()],
        InvoiceRow::read,
    )
    .optional()
    .map_err(db_error)?
    .map(InvoiceRow::into_invoice)
    .transpose()
}

#[async_trait::async_trait]
impl DedupStore for SqliteStore {
    async fn exists(&self, subject: &SubjectId, key: &NaturalKey) -> Result<bool, RepositoryError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM invoices WHERE subject_id = ?1 AND natural_key = ?2)",
            [subject.as_str(), key.as_str()],
            |row| row.get(0),
        )
        .map_err(db_error)
    }

    async fn save(&self, invoice: &ParsedInvoice) -> Result<SaveOutcome, RepositoryError> {
        let payload_json = serde_json::to_string(&invoice.payload)
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO invoices
                    (subject_id, natural_key, direction, payload_json, transferred_taxes,
                     withheld_taxes, manually_modified, imported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    invoice.subject_id.as_str(),
                    invoice.natural_key.as_str(),
                    invoice.direction.as_str(),
                    payload_json,
                    invoice.derived.transferred_taxes.cents(),
                    invoice.derived.withheld_taxes.cents(),
                    invoice.manually_modified,
                    format_timestamp(Utc::now()),
                ],
            )
            .map_err(db_error)?;

        Ok(if inserted == 0 {
            SaveOutcome::AlreadyPresent
        } else {
            SaveOutcome::Inserted
        })
    }

    async fn get(
        &self,
        subject: &SubjectId,
        key: &NaturalKey,
    ) -> Result<Option<ParsedInvoice>, RepositoryError> {
        let conn = self.conn()?;
        select(&conn, subject, key)
    }

    async fn apply_manual_edit(
        &self,
        subject: &SubjectId,
        key: &NaturalKey,
        derived: DerivedAmounts,
    ) -> Result<ParsedInvoice, RepositoryError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE invoices
                 SET transferred_taxes = ?3, withheld_taxes = ?4, manually_modified = 1,
                     edited_at = ?5
                 WHERE subject_id = ?1 AND natural_key = ?2",
                rusqlite::params![
                    subject.as_str(),
                    key.as_str(),
                    derived.transferred_taxes.cents(),
                    derived.withheld_taxes.cents(),
                    format_timestamp(Utc::now()),
                ],
            )
            .map_err(db_error)?;

        if changed == 0 {
            return Err(RepositoryError::NotFound(format!("{subject}/{key}")));
        }

        select(&conn, subject, key)?
            .ok_or_else(|| RepositoryError::NotFound(format!("{subject}/{key}")))
    }
}
