use chrono::NaiveDate;
use invoice_sync::{Direction, RepositoryError, SubjectId, WatermarkStore};
use rusqlite::OptionalExtension;

use crate::store::{SqliteStore, db_error, format_date, parse_date};

#[async_trait::async_trait]
impl WatermarkStore for SqliteStore {
    async fn get(
        &self,
        subject: &SubjectId,
        direction: Direction,
    ) -> Result<Option<NaiveDate>, RepositoryError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT synced_through FROM watermarks WHERE subject_id = ?1 AND direction = ?2",
                [subject.as_str(), direction.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_error)?;

        raw.map(|raw| parse_date(subject.as_str(), &raw)).transpose()
    }

    async fn advance(
        &self,
        subject: &SubjectId,
        direction: Direction,
        date: NaiveDate,
    ) -> Result<NaiveDate, RepositoryError> {
        let conn = self.conn()?;
        // ISO dates compare correctly as text.
        let raw: String = conn
            .query_row(
                "INSERT INTO watermarks (subject_id, direction, synced_through)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(subject_id, direction) DO UPDATE SET
                    synced_through = MAX(synced_through, excluded.synced_through)
                 RETURNING synced_through",
                rusqlite::params![subject.as_str(), direction.as_str(), format_date(date)],
                |row| row.get(0),
            )
            .map_err(db_error)?;

        parse_date(subject.as_str(), &raw)
    }
}
