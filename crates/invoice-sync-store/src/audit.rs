use invoice_sync::{AuditEntry, AuditLevel, AuditLog, RepositoryError, RequestId, Stage, SubjectId};

use crate::store::{SqliteStore, corrupt, db_error, format_timestamp, parse_timestamp};

#[async_trait::async_trait]
impl AuditLog for SqliteStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        let details_json = serde_json::to_string(&entry.details)
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log
                (subject_id, request_id, job_id, stage, level, message, details_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                entry.subject_id.as_str(),
                entry.request_id.as_ref().map(RequestId::as_str),
                entry.job_id,
                entry.stage.as_str(),
                entry.level.as_str(),
                entry.message,
                details_json,
                format_timestamp(entry.recorded_at),
            ],
        )
        .map_err(db_error)?;
        Ok(())
    }

    async fn entries_for(&self, request_id: &RequestId) -> Result<Vec<AuditEntry>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, subject_id, job_id, stage, level, message, details_json, recorded_at
                 FROM audit_log WHERE request_id = ?1 ORDER BY id",
            )
            .map_err(db_error)?;

        let rows = stmt
            .query_map([request_id.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(db_error)?;

        rows.map(|row| {
            let (id, subject_id, job_id, stage, level, message, details_json, recorded_at) =
                row.map_err(db_error)?;
            let id = format!("audit #{id}");

            Ok(AuditEntry {
                subject_id: SubjectId::new(&subject_id),
                request_id: Some(request_id.clone()),
                job_id,
                stage: Stage::parse(&stage)
                    .ok_or_else(|| corrupt(&id, format!("bad stage {stage:?}")))?,
                level: AuditLevel::parse(&level)
                    .ok_or_else(|| corrupt(&id, format!("bad level {level:?}")))?,
                message,
                details: serde_json::from_str(&details_json)
                    .map_err(|e| corrupt(&id, format!("bad details: {e}")))?,
                recorded_at: parse_timestamp(&id, &recorded_at)?,
            })
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use invoice_sync::{RequestRepository, SyncRequest};

    use super::*;

    #[tokio::test]
    async fn entries_come_back_in_append_order_with_details() {
        let store = SqliteStore::open_in_memory().unwrap();
        let request = SyncRequest::new(
            SubjectId::new("AAA010101AAA"),
            invoice_sync::Direction::Received,
            chrono::NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2025, 2, 28).unwrap(),
            chrono::Utc::now(),
        );
        store.create(&request).await.unwrap();

        store
            .append(AuditEntry::for_request(&request, Stage::Create, AuditLevel::Info, "created"))
            .await
            .unwrap();
        store
            .append(
                AuditEntry::for_request(&request, Stage::Download, AuditLevel::Warning, "1 failed")
                    .with_details(serde_json::json!({ "failed": ["P2"] })),
            )
            .await
            .unwrap();
        store
            .append(AuditEntry::new(
                request.subject_id.clone(),
                Stage::Edit,
                AuditLevel::Info,
                "unrelated",
            ))
            .await
            .unwrap();

        let entries = store.entries_for(&request.id).await.unwrap();
        let stages: Vec<Stage> = entries.iter().map(|e| e.stage).collect();
        assert_eq!(stages, [Stage::Create, Stage::Download]);
        assert_eq!(entries[1].level, AuditLevel::Warning);
        assert_eq!(entries[1].details["failed"][0], "P2");
    }
}
