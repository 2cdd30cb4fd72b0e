use rusqlite_migration::{M, Migrations};

/// Ordered schema history. Applied migrations are never edited; new
/// fields get a new migration.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE sync_requests (
                id                      TEXT PRIMARY KEY,
                subject_id              TEXT NOT NULL,
                external_job_id         TEXT,
                direction               TEXT NOT NULL,
                date_from               TEXT NOT NULL,
                date_to                 TEXT NOT NULL,
                raw_status              TEXT NOT NULL,
                package_ids_json        TEXT,
                completed               INTEGER NOT NULL DEFAULT 0,
                packages_downloaded     INTEGER NOT NULL DEFAULT 0,
                packages_processed      INTEGER NOT NULL DEFAULT 0,
                processed_with_errors   INTEGER NOT NULL DEFAULT 0,
                request_error           TEXT,
                verify_error            TEXT,
                download_error          TEXT,
                processing_error        TEXT,
                processed_count         INTEGER NOT NULL DEFAULT 0,
                existing_count          INTEGER NOT NULL DEFAULT 0,
                total_errors            INTEGER NOT NULL DEFAULT 0,
                created_at              TEXT NOT NULL,
                updated_at              TEXT NOT NULL,
                downloaded_at           TEXT,
                processed_at            TEXT
            );

            CREATE INDEX idx_sync_requests_subject ON sync_requests(subject_id, direction);

            CREATE TABLE packages (
                request_id      TEXT NOT NULL,
                package_id      TEXT NOT NULL,
                content         BLOB NOT NULL,
                downloaded_at   TEXT NOT NULL,
                PRIMARY KEY (request_id, package_id),
                FOREIGN KEY (request_id) REFERENCES sync_requests(id)
            );

            CREATE TABLE invoices (
                subject_id          TEXT NOT NULL,
                natural_key         TEXT NOT NULL,
                direction           TEXT NOT NULL,
                payload_json        TEXT NOT NULL,
                transferred_taxes   INTEGER NOT NULL,
                withheld_taxes      INTEGER NOT NULL,
                manually_modified   INTEGER NOT NULL DEFAULT 0,
                imported_at         TEXT NOT NULL,
                PRIMARY KEY (subject_id, natural_key)
            );

            CREATE TABLE watermarks (
                subject_id      TEXT NOT NULL,
                direction       TEXT NOT NULL,
                synced_through  TEXT NOT NULL,
                PRIMARY KEY (subject_id, direction)
            );",
        ),
        M::up(
            "CREATE TABLE audit_log (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id      TEXT NOT NULL,
                request_id      TEXT,
                job_id          TEXT,
                stage           TEXT NOT NULL,
                level           TEXT NOT NULL,
                message         TEXT NOT NULL,
                details_json    TEXT NOT NULL DEFAULT 'null',
                recorded_at     TEXT NOT NULL
            );

            CREATE INDEX idx_audit_log_request ON audit_log(request_id);",
        ),
        M::up("ALTER TABLE invoices ADD COLUMN edited_at TEXT;"),
    ])
}
