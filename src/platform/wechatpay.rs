use encoding_rs::{Encoding, UTF_8};

use super::{AmountError, ColumnMapping, PlatformAdapter};

const COLUMNS: ColumnMapping = ColumnMapping {
    content: "商品",
    amount: "金额(元)",
    category: "交易类型",
    datetime: "交易时间",
    counterparty: "交易对方",
    remarks: "备注",
    transaction_id: "交易单号",
    merchant_order_id: "商户单号",
    payment_method: "支付方式",
};

const EMPTY_REMARKS: &str = "/";

/// WeChat Pay emails a download link to a zipped xlsx spreadsheet.
#[derive(Default)]
pub struct Adapter;

impl Adapter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl PlatformAdapter for Adapter {
    fn id(&self) -> &'static str {
        "wechatpay"
    }

    fn display_name(&self) -> &'static str {
        "WeChatPay"
    }

    fn sender_address(&self) -> &'static str {
        "wechatpay@tencent.com"
    }

    fn bill_file_prefix(&self) -> &'static str {
        "微信支付账单"
    }

    // The staged file is our own UTF-8 conversion of the spreadsheet.
    fn raw_encoding(&self) -> &'static Encoding {
        UTF_8
    }

    fn columns(&self) -> &ColumnMapping {
        &COLUMNS
    }

    /// WeChat Pay amounts look like `¥12.34`. Unlike Alipay, anything unparseable is recorded as
    /// zero rather than failing the whole import.
    fn parse_amount(&self, raw: &str) -> Result<f64, AmountError> {
        let trimmed = raw.trim();
        let unprefixed = trimmed
            .strip_prefix('¥')
            .or_else(|| trimmed.strip_prefix('￥'))
            .unwrap_or(trimmed);

        match super::parse_finite(unprefixed) {
            Ok(amount) => Ok(amount),
            Err(err) => {
                warn!("Treating malformed WeChat Pay amount as 0: {err}");
                Ok(0.0)
            }
        }
    }

    fn normalize_remarks(&self, raw: &str) -> String {
        if raw == EMPTY_REMARKS {
            String::new()
        } else {
            raw.to_string()
        }
    }

    fn needs_spreadsheet_conversion(&self) -> bool {
        true
    }

    fn expired_export_marker(&self) -> Option<&'static str> {
        Some("请在微信中重新申请导出")
    }
}
