use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::request::{Direction, SubjectId};

/// Natural document id of an invoice (the fiscal folio UUID), upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(key.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed-point money amount in hundredths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Parse a decimal string such as `"1160.00"` or `"0.166666"`.
    /// Digits past the second decimal round half up.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));

        if whole.is_empty() && frac.is_empty() {
            return None;
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut frac_digits = frac.bytes().map(|b| i64::from(b - b'0'));
        let tenths = frac_digits.next().unwrap_or(0);
        let hundredths = frac_digits.next().unwrap_or(0);
        let round_up = frac_digits.next().is_some_and(|d| d >= 5);

        let cents = whole
            .checked_mul(100)?
            .checked_add(tenths * 10 + hundredths + i64::from(round_up))?;

        Some(Self(if negative { -cents } else { cents }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl std::str::FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid amount '{s}'"))
    }
}

/// Fields read straight from the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePayload {
    pub issuer_rfc: String,
    pub issuer_name: Option<String>,
    pub receiver_rfc: String,
    pub receiver_name: Option<String>,
    pub issued_at: NaiveDateTime,
    pub document_type: String,
    pub currency: String,
    pub subtotal: Amount,
    pub total: Amount,
}

/// Numeric fields computed from the document that a user may override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAmounts {
    pub transferred_taxes: Amount,
    pub withheld_taxes: Amount,
}

/// An invoice ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedInvoice {
    pub natural_key: NaturalKey,
    pub subject_id: SubjectId,
    pub direction: Direction,
    pub payload: InvoicePayload,
    pub derived: DerivedAmounts,
    /// Set once a user edits `derived`; imports never touch those fields again.
    pub manually_modified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_amounts() {
        assert_eq!(Amount::parse("1160.00"), Some(Amount::from_cents(116_000)));
        assert_eq!(Amount::parse("12"), Some(Amount::from_cents(1_200)));
        assert_eq!(Amount::parse("0.5"), Some(Amount::from_cents(50)));
        assert_eq!(Amount::parse(".75"), Some(Amount::from_cents(75)));
    }

    #[test]
    fn rounds_extra_decimals_half_up() {
        assert_eq!(Amount::parse("10.005"), Some(Amount::from_cents(1_001)));
        assert_eq!(Amount::parse("10.004999"), Some(Amount::from_cents(1_000)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Amount::parse(""), None);
        assert_eq!(Amount::parse("."), None);
        assert_eq!(Amount::parse("12a.00"), None);
        assert_eq!(Amount::parse("1,000.00"), None);
    }

    #[test]
    fn displays_two_decimals() {
        assert_eq!(Amount::from_cents(116_000).to_string(), "1160.00");
        assert_eq!(Amount::from_cents(-5).to_string(), "-0.05");
    }

    #[test]
    fn natural_keys_are_upper_cased() {
        let key = NaturalKey::new("ad662d33-6934-459c-a128-bdf0393e0f44");
        assert_eq!(key.as_str(), "AD662D33-6934-459C-A128-BDF0393E0F44");
    }
}
