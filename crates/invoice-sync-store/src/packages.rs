use invoice_sync::{Package, PackageStore, RepositoryError, RequestId};

use crate::store::{SqliteStore, db_error, format_timestamp, parse_timestamp};

#[async_trait::async_trait]
impl PackageStore for SqliteStore {
    async fn save(&self, package: &Package) -> Result<(), RepositoryError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO packages (request_id, package_id, content, downloaded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(request_id, package_id) DO UPDATE SET
                content = excluded.content,
                downloaded_at = excluded.downloaded_at",
            rusqlite::params![
                package.request_id.as_str(),
                package.package_id,
                package.content,
                format_timestamp(package.downloaded_at),
            ],
        )
        .map_err(db_error)?;

        tracing::debug!(
            request = %package.request_id,
            package = %package.package_id,
            bytes = package.content.len(),
            "stored package"
        );
        Ok(())
    }

    async fn list_ids(&self, request_id: &RequestId) -> Result<Vec<String>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT package_id FROM packages WHERE request_id = ?1 ORDER BY rowid")
            .map_err(db_error)?;
        let rows = stmt
            .query_map([request_id.as_str()], |row| row.get(0))
            .map_err(db_error)?;

        rows.collect::<Result<Vec<String>, _>>().map_err(db_error)
    }

    async fn load(&self, request_id: &RequestId) -> Result<Vec<Package>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT package_id, content, downloaded_at FROM packages
                 WHERE request_id = ?1 ORDER BY rowid",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map([request_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_error)?;

        rows.map(|row| {
            let (package_id, content, downloaded_at) = row.map_err(db_error)?;
            Ok(Package {
                downloaded_at: parse_timestamp(&package_id, &downloaded_at)?,
                package_id,
                request_id: request_id.clone(),
                content,
            })
        })
        .collect()
    }
}
