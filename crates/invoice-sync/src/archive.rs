use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::ArchiveError;

/// A document extracted from a package archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDocument {
    /// Path of the entry inside the archive.
    pub name: String,
    pub content: Vec<u8>,
}

/// Whether an archive entry is an invoice document worth parsing.
/// Metadata listings, hidden files and resource forks are not.
pub fn is_candidate_document(name: &str) -> bool {
    let file_name = name.rsplit('/').next().unwrap_or(name);

    if file_name.starts_with('.') || name.starts_with("__MACOSX/") {
        return false;
    }

    file_name.to_lowercase().ends_with(".xml")
}

/// Unpack a gzip-compressed tar package and return its candidate documents.
///
/// Any read failure means the package cannot be trusted as a whole and is
/// reported as an error for the entire archive.
pub fn unpack(archive_bytes: &[u8]) -> Result<Vec<ArchiveDocument>, ArchiveError> {
    let decoder = GzDecoder::new(archive_bytes);
    let mut archive = tar::Archive::new(decoder);

    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::Unreadable(e.to_string()))?;

    let mut documents = Vec::new();

    for entry_result in entries {
        let mut entry = entry_result.map_err(|e| ArchiveError::Unreadable(e.to_string()))?;

        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }

        let name = entry
            .path()
            .map_err(|e| ArchiveError::Entry(format!("invalid path: {e}")))?
            .to_string_lossy()
            .to_string();

        if !is_candidate_document(&name) {
            continue;
        }

        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| ArchiveError::Entry(format!("{name}: {e}")))?;

        documents.push(ArchiveDocument { name, content });
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::build_package;

    #[test]
    fn candidate_documents_are_xml_files() {
        assert!(is_candidate_document("AD662D33.xml"));
        assert!(is_candidate_document("nested/AD662D33.XML"));
        assert!(!is_candidate_document("metadata.txt"));
        assert!(!is_candidate_document(".hidden.xml"));
        assert!(!is_candidate_document("__MACOSX/AD662D33.xml"));
    }

    #[test]
    fn unpacks_xml_entries_only() {
        let package = build_package(&[
            ("A.xml", b"<a/>".as_slice()),
            ("listing.txt", b"A".as_slice()),
            ("B.xml", b"<b/>".as_slice()),
        ]);

        let documents = unpack(&package).unwrap();
        let names: Vec<&str> = documents.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["A.xml", "B.xml"]);
        assert_eq!(documents[0].content, b"<a/>");
    }

    #[test]
    fn garbage_is_unreadable() {
        let result = unpack(b"definitely not a gzip stream");
        assert!(matches!(result, Err(ArchiveError::Unreadable(_))));
    }

    #[test]
    fn empty_package_has_no_documents() {
        let package = build_package(&[]);
        assert!(unpack(&package).unwrap().is_empty());
    }
}
