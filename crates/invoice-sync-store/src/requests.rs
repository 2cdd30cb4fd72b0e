use invoice_sync::admission::count_in_flight;
use invoice_sync::request::Timestamps;
use invoice_sync::{
    Direction, ImportCounts, RepositoryError, RequestId, RequestRepository, StageErrors,
    SubjectId, SyncRequest,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::store::{
    SqliteStore, corrupt, db_error, format_date, format_timestamp, parse_date, parse_direction,
    parse_timestamp,
};

const COLUMNS: &str = "id, subject_id, external_job_id, direction, date_from, date_to,
    raw_status, package_ids_json, completed, packages_downloaded, packages_processed,
    processed_with_errors, request_error, verify_error, download_error, processing_error,
    processed_count, existing_count, total_errors, created_at, updated_at, downloaded_at,
    processed_at";

/// A request row as stored, before validation.
struct RequestRow {
    id: String,
    subject_id: String,
    external_job_id: Option<String>,
    direction: String,
    date_from: String,
    date_to: String,
    raw_status: String,
    package_ids_json: Option<String>,
    completed: bool,
    packages_downloaded: bool,
    packages_processed: bool,
    processed_with_errors: bool,
    stage_errors: StageErrors,
    counts: [i64; 3],
    created_at: String,
    updated_at: String,
    downloaded_at: Option<String>,
    processed_at: Option<String>,
}

impl RequestRow {
    fn read(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            external_job_id: row.get(2)?,
            direction: row.get(3)?,
            date_from: row.get(4)?,
            date_to: row.get(5)?,
            raw_status: row.get(6)?,
            package_ids_json: row.get(7)?,
            completed: row.get(8)?,
            packages_downloaded: row.get(9)?,
            packages_processed: row.get(10)?,
            processed_with_errors: row.get(11)?,
            stage_errors: StageErrors {
                request_error: row.get(12)?,
                verify_error: row.get(13)?,
                download_error: row.get(14)?,
                processing_error: row.get(15)?,
            },
            counts: [row.get(16)?, row.get(17)?, row.get(18)?],
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
            downloaded_at: row.get(21)?,
            processed_at: row.get(22)?,
        })
    }

    fn into_request(self) -> Result<SyncRequest, RepositoryError> {
        let id = self.id.as_str();

        let package_ids = self
            .package_ids_json
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()
            .map_err(|e| corrupt(id, format!("bad package ids: {e}")))?;

        let count = |n: i64| u64::try_from(n).map_err(|_| corrupt(id, format!("negative count {n}")));
        let counts = ImportCounts {
            processed_count: count(self.counts[0])?,
            existing_count: count(self.counts[1])?,
            total_errors: count(self.counts[2])?,
        };

        let timestamps = Timestamps {
            created_at: parse_timestamp(id, &self.created_at)?,
            updated_at: parse_timestamp(id, &self.updated_at)?,
            downloaded_at: self
                .downloaded_at
                .as_deref()
                .map(|raw| parse_timestamp(id, raw))
                .transpose()?,
            processed_at: self
                .processed_at
                .as_deref()
                .map(|raw| parse_timestamp(id, raw))
                .transpose()?,
        };

        Ok(SyncRequest {
            direction: parse_direction(id, &self.direction)?,
            date_from: parse_date(id, &self.date_from)?,
            date_to: parse_date(id, &self.date_to)?,
            id: RequestId::new(self.id.clone()),
            subject_id: SubjectId::new(&self.subject_id),
            external_job_id: self.external_job_id,
            raw_status: self.raw_status,
            package_ids,
            completed: self.completed,
            packages_downloaded: self.packages_downloaded,
            packages_processed: self.packages_processed,
            processed_with_errors: self.processed_with_errors,
            stage_errors: self.stage_errors,
            counts,
            timestamps,
        })
    }
}

fn insert(conn: &Connection, request: &SyncRequest) -> Result<(), RepositoryError> {
    conn.execute(
        &format!(
            "INSERT INTO sync_requests ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
        ),
        rusqlite::params_from_iter(params(request)?.iter()),
    )
    .map_err(db_error)?;
    Ok(())
}

fn params(request: &SyncRequest) -> Result<Vec<Box<dyn rusqlite::ToSql>>, RepositoryError> {
    let package_ids_json = request
        .package_ids
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RepositoryError::Database(e.to_string()))?;
    let count = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
    let errors = &request.stage_errors;
    let at = &request.timestamps;

    Ok(vec![
        Box::new(request.id.as_str().to_owned()),
        Box::new(request.subject_id.as_str().to_owned()),
        Box::new(request.external_job_id.clone()),
        Box::new(request.direction.as_str()),
        Box::new(format_date(request.date_from)),
        Box::new(format_date(request.date_to)),
        Box::new(request.raw_status.clone()),
        Box::new(package_ids_json),
        Box::new(request.completed),
        Box::new(request.packages_downloaded),
        Box::new(request.packages_processed),
        Box::new(request.processed_with_errors),
        Box::new(errors.request_error.clone()),
        Box::new(errors.verify_error.clone()),
        Box::new(errors.download_error.clone()),
        Box::new(errors.processing_error.clone()),
        Box::new(count(request.counts.processed_count)),
        Box::new(count(request.counts.existing_count)),
        Box::new(count(request.counts.total_errors)),
        Box::new(format_timestamp(at.created_at)),
        Box::new(format_timestamp(at.updated_at)),
        Box::new(at.downloaded_at.map(format_timestamp)),
        Box::new(at.processed_at.map(format_timestamp)),
    ])
}

fn select_for(
    conn: &Connection,
    subject: &SubjectId,
    direction: Direction,
) -> Result<Vec<SyncRequest>, RepositoryError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {COLUMNS} FROM sync_requests
             WHERE subject_id = ?1 AND direction = ?2
             ORDER BY created_at, rowid"
        ))
        .map_err(db_error)?;

    let rows = stmt
        .query_map(
            rusqlite::params![subject.as_str(), direction.as_str()],
            RequestRow::read,
        )
        .map_err(db_error)?;

    rows.map(|row| row.map_err(db_error)?.into_request())
        .collect()
}

#[async_trait::async_trait]
impl RequestRepository for SqliteStore {
    async fn create(&self, request: &SyncRequest) -> Result<(), RepositoryError> {
        let conn = self.conn()?;
        insert(&conn, request)
    }

    async fn create_within_quota(
        &self,
        request: &SyncRequest,
        limit: usize,
    ) -> Result<bool, RepositoryError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error)?;

        let existing = select_for(&tx, &request.subject_id, request.direction)?;
        let in_flight = count_in_flight(&existing);
        if in_flight >= limit {
            tracing::debug!(
                subject = %request.subject_id,
                direction = %request.direction,
                in_flight,
                "quota reached, reservation not inserted"
            );
            return Ok(false);
        }

        insert(&tx, request)?;
        tx.commit().map_err(db_error)?;
        Ok(true)
    }

    async fn get(&self, id: &RequestId) -> Result<Option<SyncRequest>, RepositoryError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM sync_requests WHERE id = ?1"),
            [id.as_str()],
            RequestRow::read,
        )
        .optional()
        .map_err(db_error)?
        .map(RequestRow::into_request)
        .transpose()
    }

    async fn update(&self, request: &SyncRequest) -> Result<(), RepositoryError> {
        let conn = self.conn()?;
        let params = params(request)?;

        let changed = conn
            .execute(
                "UPDATE sync_requests SET
                    subject_id = ?2, external_job_id = ?3, direction = ?4, date_from = ?5,
                    date_to = ?6, raw_status = ?7, package_ids_json = ?8, completed = ?9,
                    packages_downloaded = ?10, packages_processed = ?11,
                    processed_with_errors = ?12, request_error = ?13, verify_error = ?14,
                    download_error = ?15, processing_error = ?16, processed_count = ?17,
                    existing_count = ?18, total_errors = ?19, created_at = ?20,
                    updated_at = ?21, downloaded_at = ?22, processed_at = ?23
                 WHERE id = ?1",
                rusqlite::params_from_iter(params.iter()),
            )
            .map_err(db_error)?;

        if changed == 0 {
            return Err(RepositoryError::NotFound(request.id.to_string()));
        }
        Ok(())
    }

    async fn list_for(
        &self,
        subject: &SubjectId,
        direction: Direction,
    ) -> Result<Vec<SyncRequest>, RepositoryError> {
        let conn = self.conn()?;
        select_for(&conn, subject, direction)
    }

    async fn list(&self, subject: Option<&SubjectId>) -> Result<Vec<SyncRequest>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM sync_requests
                 WHERE ?1 IS NULL OR subject_id = ?1
                 ORDER BY created_at, rowid"
            ))
            .map_err(db_error)?;

        let rows = stmt
            .query_map([subject.map(SubjectId::as_str)], RequestRow::read)
            .map_err(db_error)?;

        rows.map(|row| row.map_err(db_error)?.into_request())
            .collect()
    }
}
