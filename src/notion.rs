//! Provides sinks for normalized records: a Notion client, and a JSON lines writer for dry runs.

use std::io::Write;

use async_trait::async_trait;
use reqwest::{Response, Url};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::normalize::CanonicalRecord;

const PAGES_URL: &str = "https://api.notion.com/v1/pages";
const NOTION_VERSION: &str = "2025-09-03";
/// Notion rejects empty select options, so blank values are filed under this one.
const UNDEFINED_SELECT: &str = "undefined";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to build Notion request: {0}")]
    RequestBuildFailed(reqwest::Error),
    #[error("Failed to write record: {0}")]
    WriteFailed(#[from] std::io::Error),
    #[error("Failed to serialize record: {0}")]
    SerializeFailed(#[from] serde_json::Error),
}

/// How many records a sink accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub exported: usize,
    pub failed: usize,
}

/// A `RecordSink` is where normalized records end up.
#[async_trait]
pub trait RecordSink {
    /// Hand every record to the sink. Records the destination rejects are counted as failed rather
    /// than aborting the export.
    ///
    /// # Errors
    /// Returns an [`Error`] only when the sink itself is unusable.
    async fn export(&mut self, records: &[CanonicalRecord]) -> Result<ExportSummary, Error>;
}

#[async_trait]
impl<S: RecordSink + Send + ?Sized> RecordSink for Box<S> {
    async fn export(&mut self, records: &[CanonicalRecord]) -> Result<ExportSummary, Error> {
        (**self).export(records).await
    }
}

#[derive(Debug, Serialize)]
struct PageRequest<'a> {
    parent: Parent<'a>,
    properties: Value,
}

#[derive(Debug, Serialize)]
struct Parent<'a> {
    data_source_id: &'a str,
}

/// Client creates one Notion page per record in a data source, authenticating with an integration
/// token.
pub struct Client {
    token: String,
    data_source_id: String,
    time_zone: String,
    http_client: reqwest::Client,
}

impl Client {
    /// Make a new `Client` that will create pages in the given data source.
    #[must_use]
    pub fn new(token: String, data_source_id: String, time_zone: String) -> Self {
        Self {
            token,
            data_source_id,
            time_zone,
            http_client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &crate::config::Notion) -> Self {
        Self::new(
            config.token().to_string(),
            config.data_source_id().to_string(),
            config.time_zone().to_string(),
        )
    }

    /// Create a single page for the record. Returns whether Notion accepted it.
    async fn create_page(&self, record: &CanonicalRecord) -> Result<bool, Error> {
        let page = PageRequest {
            parent: Parent {
                data_source_id: &self.data_source_id,
            },
            properties: page_properties(record, &self.time_zone),
        };

        // The URL is a constant, so failing to parse it is programmer error
        let url = Url::parse(PAGES_URL).expect("parsing notion pages url failed");
        let request = self
            .http_client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", NOTION_VERSION)
            .json(&page)
            .build()
            .map_err(Error::RequestBuildFailed)?;

        match self.http_client.execute(request).await {
            Ok(response) => Ok(Self::log_status(response, record).await),
            Err(err) => {
                error!("Failed to send Notion request for '{}': {err}", record.content);
                Ok(false)
            }
        }
    }

    async fn log_status(res: Response, record: &CanonicalRecord) -> bool {
        let status_code = res.status();
        if status_code.is_success() {
            debug!("Created page for '{}' ({})", record.content, record.datetime);
            return true;
        }

        let body = res
            .text()
            .await
            .unwrap_or_else(|err| format!("<unreadable body: {err}>"));
        error!(
            "Got status code {status_code} creating page for '{}', skipping; response: {body}",
            record.content
        );

        false
    }
}

#[async_trait]
impl RecordSink for Client {
    async fn export(&mut self, records: &[CanonicalRecord]) -> Result<ExportSummary, Error> {
        let mut summary = ExportSummary::default();
        for record in records {
            if self.create_page(record).await? {
                summary.exported += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            "Exported {} records to Notion ({} failed)",
            summary.exported, summary.failed
        );
        Ok(summary)
    }
}

/// Writes each record as one line of JSON.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl JsonLinesSink<std::io::Stdout> {
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    async fn export(&mut self, records: &[CanonicalRecord]) -> Result<ExportSummary, Error> {
        for record in records {
            serde_json::to_writer(&mut self.writer, record)?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;

        Ok(ExportSummary {
            exported: records.len(),
            failed: 0,
        })
    }
}

fn page_properties(record: &CanonicalRecord, time_zone: &str) -> Value {
    json!({
        "Name": {"title": rich_text(&record.content)},
        "Price": {"number": record.amount},
        "Category": {"select": {"name": select_name(&record.category)}},
        "Date": {"date": {"start": record.datetime, "time_zone": time_zone}},
        "From": {"select": {"name": select_name(&record.source_platform)}},
        "Counterparty": {"rich_text": rich_text(&record.counterparty)},
        "Remarks": {"rich_text": rich_text(&record.remarks)},
        "Transaction Number": {"rich_text": rich_text(&record.transaction_id)},
        "Merchant Tracking Number": {"rich_text": rich_text(&record.merchant_order_id)},
        "Payment Method": {"select": {"name": select_name(&record.payment_method)}},
    })
}

fn rich_text(content: &str) -> Value {
    json!([{"text": {"content": content}}])
}

/// Select option names may not contain commas or be empty.
fn select_name(raw: &str) -> String {
    let name = raw.replace(',', "");
    if name.trim().is_empty() {
        UNDEFINED_SELECT.to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn record() -> CanonicalRecord {
        CanonicalRecord {
            content: "午饭".to_string(),
            amount: 23.5,
            category: "餐饮,美食".to_string(),
            datetime: "2023-01-02T03:04:05Z".to_string(),
            counterparty: "某某餐厅".to_string(),
            remarks: String::new(),
            transaction_id: "2023010222001".to_string(),
            merchant_order_id: "T123".to_string(),
            payment_method: String::new(),
            source_platform: "Alipay".to_string(),
        }
    }

    #[test_case("餐饮美食", "餐饮美食"; "plain")]
    #[test_case("招商银行(1234),花呗", "招商银行(1234)花呗"; "commas removed")]
    #[test_case("", "undefined"; "empty")]
    #[test_case(",", "undefined"; "only commas")]
    fn test_select_name(raw: &str, expected: &str) {
        assert_eq!(expected, select_name(raw));
    }

    #[test]
    fn test_page_properties() {
        let properties = page_properties(&record(), "Asia/Shanghai");

        assert_eq!(json!("午饭"), properties["Name"]["title"][0]["text"]["content"]);
        assert_eq!(json!(23.5), properties["Price"]["number"]);
        assert_eq!(json!("餐饮美食"), properties["Category"]["select"]["name"]);
        assert_eq!(
            json!({"start": "2023-01-02T03:04:05Z", "time_zone": "Asia/Shanghai"}),
            properties["Date"]["date"]
        );
        assert_eq!(json!("Alipay"), properties["From"]["select"]["name"]);
        assert_eq!(json!(""), properties["Remarks"]["rich_text"][0]["text"]["content"]);
        assert_eq!(json!("undefined"), properties["Payment Method"]["select"]["name"]);
    }

    #[test]
    fn test_page_request_names_the_data_source() {
        let page = PageRequest {
            parent: Parent {
                data_source_id: "abc123",
            },
            properties: page_properties(&record(), "Asia/Shanghai"),
        };

        let serialized = serde_json::to_value(&page).expect("failed to serialize");

        assert_eq!(json!({"data_source_id": "abc123"}), serialized["parent"]);
    }

    #[tokio::test]
    async fn test_json_lines_sink_writes_one_line_per_record() {
        let mut sink = JsonLinesSink::new(Vec::new());

        let summary = sink
            .export(&[record(), record()])
            .await
            .expect("failed to export");

        let output = String::from_utf8(sink.into_inner()).expect("output is not utf-8");
        let lines = output.lines().collect::<Vec<_>>();
        assert_eq!(ExportSummary { exported: 2, failed: 0 }, summary);
        assert_eq!(2, lines.len());
        let parsed: Value = serde_json::from_str(lines[0]).expect("line is not json");
        assert_eq!(json!("Alipay"), parsed["source_platform"]);
    }
}
