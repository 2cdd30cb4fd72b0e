use crate::error::ParseError;
use crate::invoice::ParsedInvoice;
use crate::request::SubjectId;

/// Turns one raw document from a package into an invoice.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, raw: &[u8], subject: &SubjectId) -> Result<ParsedInvoice, ParseError>;
}
