use encoding_rs::{Encoding, GBK};

use super::{AmountError, ColumnMapping, PlatformAdapter};

const COLUMNS: ColumnMapping = ColumnMapping {
    content: "商品说明",
    amount: "金额",
    category: "交易分类",
    datetime: "交易时间",
    counterparty: "交易对方",
    remarks: "备注",
    transaction_id: "交易订单号",
    merchant_order_id: "商家订单号",
    payment_method: "收/付款方式",
};

/// Alipay emails a zip attachment holding a GBK encoded CSV.
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
        "alipay"
    }

    fn display_name(&self) -> &'static str {
        "Alipay"
    }

    fn sender_address(&self) -> &'static str {
        "service@mail.alipay.com"
    }

    fn bill_file_prefix(&self) -> &'static str {
        "支付宝交易明细"
    }

    fn raw_encoding(&self) -> &'static Encoding {
        GBK
    }

    fn columns(&self) -> &ColumnMapping {
        &COLUMNS
    }

    /// Alipay amounts are plain numbers; anything else is an error.
    fn parse_amount(&self, raw: &str) -> Result<f64, AmountError> {
        super::parse_finite(raw)
    }
}
