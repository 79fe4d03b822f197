//! Per-platform knowledge: where bills come from, what they are called, and how their columns read.

pub use alipay::Adapter as AlipayAdapter;
pub use wechatpay::Adapter as WechatpayAdapter;

use encoding_rs::Encoding;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use thiserror::Error;

mod alipay;
mod wechatpay;

/// The extension every bill archive carries.
pub const ARCHIVE_EXTENSION: &str = ".zip";

#[derive(Error, Debug)]
#[error("failed to parse amount '{amount}': {reason}")]
pub struct AmountError {
    amount: String,
    reason: String,
}

impl AmountError {
    fn new<S: Into<String>>(amount: &str, reason: S) -> Self {
        Self {
            amount: amount.to_string(),
            reason: reason.into(),
        }
    }
}

/// The names of a platform's native columns for each canonical field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnMapping {
    pub content: &'static str,
    pub amount: &'static str,
    pub category: &'static str,
    pub datetime: &'static str,
    pub counterparty: &'static str,
    pub remarks: &'static str,
    pub transaction_id: &'static str,
    pub merchant_order_id: &'static str,
    pub payment_method: &'static str,
}

/// A `PlatformAdapter` holds everything that differs between payment platforms. Shared logic must
/// only ever go through this trait; adding a platform means adding an implementation.
pub trait PlatformAdapter: Send + Sync {
    /// The identifier used in file names and password subjects, e.g. `alipay`.
    fn id(&self) -> &'static str;

    /// The name shown to users and in exported records, e.g. `Alipay`.
    fn display_name(&self) -> &'static str;

    /// The address bill notifications are sent from.
    fn sender_address(&self) -> &'static str;

    /// Every exported bill file (archive or extracted) starts with this prefix.
    fn bill_file_prefix(&self) -> &'static str;

    /// The encoding of the staged raw file.
    fn raw_encoding(&self) -> &'static Encoding;

    fn columns(&self) -> &ColumnMapping;

    /// Convert a raw amount cell to a number.
    ///
    /// # Errors
    /// Implementations may either reject malformed input with an [`AmountError`] or coerce it.
    fn parse_amount(&self, raw: &str) -> Result<f64, AmountError>;

    /// Translate the platform's "nothing here" sentinel in the remarks column to an empty string.
    fn normalize_remarks(&self, raw: &str) -> String {
        raw.to_string()
    }

    /// Whether the raw export is a spreadsheet that must be converted to delimited text.
    fn needs_spreadsheet_conversion(&self) -> bool {
        false
    }

    /// Text a download page contains when the export link has expired or been used too often.
    fn expired_export_marker(&self) -> Option<&'static str> {
        None
    }
}

/// The known payment platforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Alipay,
    Wechatpay,
}

impl Platform {
    /// Construct the adapter for this platform.
    #[must_use]
    pub fn adapter(self) -> Box<dyn PlatformAdapter> {
        match self {
            Platform::Alipay => Box::new(AlipayAdapter::new()),
            Platform::Wechatpay => Box::new(WechatpayAdapter::new()),
        }
    }
}

/// Parse a finite amount, rejecting anything else.
fn parse_finite(raw: &str) -> Result<f64, AmountError> {
    let amount = raw
        .trim()
        .parse::<f64>()
        .map_err(|err| AmountError::new(raw, err.to_string()))?;

    if amount.is_finite() {
        Ok(amount)
    } else {
        Err(AmountError::new(raw, "amount is not a finite number"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;
    use test_case::test_case;

    #[test_case("alipay", Platform::Alipay)]
    #[test_case("wechatpay", Platform::Wechatpay)]
    fn test_platform_parses_from_id(raw: &str, expected: Platform) {
        assert_eq!(expected, Platform::from_str(raw).expect("failed to parse platform"));
    }

    #[test]
    fn test_adapter_ids_match_platform_names() {
        for platform in Platform::iter() {
            assert_eq!(platform.to_string(), platform.adapter().id());
        }
    }

    #[test_case("12.5", 12.5)]
    #[test_case(" 7 ", 7.0; "surrounding whitespace")]
    fn test_parse_finite(raw: &str, expected: f64) {
        let amount = parse_finite(raw).expect("failed to parse amount");
        assert!((amount - expected).abs() < f64::EPSILON);
    }

    #[test_case("inf")]
    #[test_case("NaN")]
    #[test_case("abc")]
    fn test_parse_finite_rejects(raw: &str) {
        parse_finite(raw).expect_err("should not have parsed");
    }
}
