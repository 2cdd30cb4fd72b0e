use invoice_sync::{AuditEntry, StatusReport};

const MAX_LABEL_WIDTH: usize = 28;

pub fn print_report(report: &StatusReport) {
    println!("ID:        {}", report.id);
    println!("Subject:   {} ({})", report.subject_id, report.direction);
    println!("Range:     {} to {}", report.date_from, report.date_to);
    println!("Status:    {} (provider: {})", report.label, report.raw_status);
    println!("Packages:  {}", report.package_count);
    println!(
        "Invoices:  {} new, {} existing, {} errors",
        report.counts.processed_count, report.counts.existing_count, report.counts.total_errors
    );
    for (stage, message) in &report.errors {
        println!("  {stage} error: {message}");
    }
    if report.needs_resolution {
        println!("  no provider job recorded: attach one with --job or --abandon it");
    }
}

pub fn print_report_table(reports: &[StatusReport]) {
    if reports.is_empty() {
        return;
    }

    let label_width = reports
        .iter()
        .map(|r| r.label.as_str().chars().count())
        .max()
        .unwrap_or(0)
        .min(MAX_LABEL_WIDTH);

    for report in reports {
        println!(
            "{}  {:<13}  {:<8}  {} to {}  {:<width$}  {}{}",
            report.id,
            report.subject_id.as_str(),
            report.direction.as_str(),
            report.date_from,
            report.date_to,
            truncate(report.label.as_str(), label_width),
            counts_column(report),
            if report.needs_resolution { "  needs resolution" } else { "" },
            width = label_width
        );
    }

    println!("\n{} jobs", reports.len());
    let unresolved = reports.iter().filter(|r| r.needs_resolution).count();
    if unresolved > 0 {
        println!("{unresolved} without a provider job (see `invoice-sync resolve`)");
    }
}

pub fn print_entries(entries: &[AuditEntry]) {
    for entry in entries {
        let job = entry.job_id.as_deref().unwrap_or("-");
        println!(
            "{}  {:<6}  {}",
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            job,
            entry
        );
    }
}

fn counts_column(report: &StatusReport) -> String {
    let counts = report.counts;
    if counts.processed_count + counts.existing_count + counts.total_errors == 0 {
        return String::new();
    }
    format!(
        "{}/{}/{}",
        counts.processed_count, counts.existing_count, counts.total_errors
    )
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_owned()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};
    use invoice_sync::{Direction, SubjectId, SyncRequest};

    use super::*;

    fn report() -> StatusReport {
        let request = SyncRequest::new(
            SubjectId::new("AAA010101AAA"),
            Direction::Issued,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            Utc::now(),
        );
        StatusReport::from_request(&request)
    }

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate("processed", 28), "processed");
    }

    #[test]
    fn truncate_long_string_adds_ellipsis() {
        assert_eq!(truncate("downloaded, awaiting import", 10), "downloade…");
    }

    #[test]
    fn counts_column_is_blank_before_import() {
        assert_eq!(counts_column(&report()), "");
    }

    #[test]
    fn counts_column_shows_new_existing_errors() {
        let mut report = report();
        report.counts.processed_count = 8;
        report.counts.total_errors = 2;
        assert_eq!(counts_column(&report), "8/0/2");
    }
}
