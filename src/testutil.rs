//! Provides items that may be useful for testing

use std::{
    collections::HashMap,
    io::{Cursor, Write},
    sync::Mutex,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use zip::{
    unstable::write::FileOptionsExt, write::FileOptions, AesMode, CompressionMethod, ZipWriter,
};

use crate::{
    attachment::download::{Download, DownloadError, Downloader},
    email::{message::Message, Mailbox, Uid},
};
use url::Url;

/// An in-memory mailbox. Messages are listed in ascending UID order, like a real server.
pub struct MockMailbox {
    address: String,
    messages: HashMap<u32, Message>,
    fetched: Vec<u32>,
}

impl MockMailbox {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            messages: HashMap::new(),
            fetched: Vec::new(),
        }
    }

    pub fn stage(&mut self, uid: u32, message: Message) {
        self.messages.insert(uid, message);
    }

    /// The UIDs fetched so far, in fetch order.
    pub fn fetched(&self) -> Vec<u32> {
        self.fetched.clone()
    }
}

#[derive(thiserror::Error, Debug)]
#[error("uid {0} not found")]
pub struct MissingMessage(Uid);

#[async_trait]
impl Mailbox for MockMailbox {
    type Error = MissingMessage;

    fn address(&self) -> &str {
        &self.address
    }

    async fn list_all(&mut self) -> Result<Vec<Uid>, Self::Error> {
        let mut uids = self.messages.keys().copied().map(Uid::new).collect::<Vec<_>>();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch(&mut self, uid: Uid) -> Result<Message, Self::Error> {
        self.fetched.push(uid.value());
        self.messages
            .get(&uid.value())
            .cloned()
            .ok_or(MissingMessage(uid))
    }
}

/// Serves canned responses keyed by URL. Unknown URLs get a 404.
#[derive(Default)]
pub struct MockDownloader {
    responses: HashMap<String, Download>,
    requested: Mutex<Vec<String>>,
}

impl MockDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, url: &str, download: Download) {
        self.responses.insert(url.to_string(), download);
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn get(&self, url: &Url) -> Result<Download, DownloadError> {
        self.requested
            .lock()
            .expect("lock poisoned")
            .push(url.to_string());

        Ok(self
            .responses
            .get(url.as_str())
            .cloned()
            .unwrap_or_else(|| Download::new(404, None, b"not found".to_vec())))
    }
}

fn encode_word(text: &str) -> String {
    format!("=?UTF-8?B?{}?=", BASE64.encode(text.as_bytes()))
}

/// A plain text message with an encoded subject.
pub fn text_message(from: &str, subject: &str) -> Message {
    let raw = format!(
        "From: Someone <{from}>\r\nTo: me@163.com\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nhello\r\n",
        encode_word(subject)
    );

    Message::new(raw.into_bytes())
}

/// A multipart message whose HTML part holds the given markup.
pub fn html_message(from: &str, subject: &str, html: &str) -> Message {
    let raw = format!(
        "From: {from}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: multipart/alternative; boundary=\"b1\"\r\n\r\n--b1\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nsee the html part\r\n--b1\r\nContent-Type: text/html; charset=utf-8\r\nContent-Transfer-Encoding: base64\r\n\r\n{}\r\n--b1--\r\n",
        encode_word(subject),
        BASE64.encode(html.as_bytes()),
    );

    Message::new(raw.into_bytes())
}

/// A multipart message with a base64 attachment whose filename is RFC2047 encoded.
pub fn attachment_message(from: &str, filename: &str, payload: &[u8]) -> Message {
    attachment_message_named(from, &encode_word(filename), payload)
}

/// A multipart message with a base64 attachment whose filename parameter is written verbatim.
pub fn attachment_message_named(from: &str, raw_filename: &str, payload: &[u8]) -> Message {
    let raw = format!(
        "From: {from}\r\nSubject: bill\r\nMIME-Version: 1.0\r\nContent-Type: multipart/mixed; boundary=\"outer\"\r\n\r\n--outer\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nyour bill is attached\r\n--outer\r\nContent-Type: application/zip\r\nContent-Disposition: attachment; filename=\"{raw_filename}\"\r\nContent-Transfer-Encoding: base64\r\n\r\n{}\r\n--outer--\r\n",
        BASE64.encode(payload),
    );

    Message::new(raw.into_bytes())
}

/// How entries in a test archive are protected.
#[derive(Clone, Copy)]
pub enum Protection<'a> {
    None,
    Aes(&'a str),
    ZipCrypto(&'a str),
}

/// Build an in-memory zip archive.
pub fn zip_bytes(entries: &[(&str, &[u8])], protection: Protection<'_>) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        let options = FileOptions::<()>::default().compression_method(CompressionMethod::Deflated);
        let options = match protection {
            Protection::None => options,
            Protection::Aes(password) => options.with_aes_encryption(AesMode::Aes256, password),
            Protection::ZipCrypto(password) => {
                FileOptionsExt::with_deprecated_encryption(options, password.as_bytes())
            }
        };

        writer
            .start_file(*name, options)
            .expect("failed to start zip entry");
        writer.write_all(contents).expect("failed to write zip entry");
    }

    writer.finish().expect("failed to finish zip").into_inner()
}

/// A cell in a test spreadsheet.
#[derive(Clone, Copy)]
pub enum Cell<'a> {
    Text(&'a str),
    Number(f64),
    /// An Excel serial date, styled with the built-in `m/d/yy h:mm` format.
    DateTime(f64),
}

const XLSX_CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/></Types>"#;

const XLSX_ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const XLSX_WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#;

const XLSX_WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/></Relationships>"#;

const XLSX_STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="1"><fill><patternFill patternType="none"/></fill></fills><borders count="1"><border/></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="22" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/></cellXfs></styleSheet>"#;

/// Build a single-sheet xlsx workbook. Text is written as inline strings and is not escaped.
pub fn xlsx_bytes(rows: &[Vec<Cell<'_>>]) -> Vec<u8> {
    let mut sheet = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (row_index, row) in rows.iter().enumerate() {
        let row_number = row_index + 1;
        sheet.push_str(&format!(r#"<row r="{row_number}">"#));
        for (column_index, cell) in row.iter().enumerate() {
            let column = char::from(b'A' + u8::try_from(column_index).expect("too many columns"));
            let reference = format!("{column}{row_number}");
            let xml = match cell {
                Cell::Text(text) => {
                    format!(r#"<c r="{reference}" t="inlineStr"><is><t>{text}</t></is></c>"#)
                }
                Cell::Number(value) => format!(r#"<c r="{reference}"><v>{value}</v></c>"#),
                Cell::DateTime(serial) => {
                    format!(r#"<c r="{reference}" s="1"><v>{serial}</v></c>"#)
                }
            };
            sheet.push_str(&xml);
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");

    let parts = [
        ("[Content_Types].xml", XLSX_CONTENT_TYPES),
        ("_rels/.rels", XLSX_ROOT_RELS),
        ("xl/workbook.xml", XLSX_WORKBOOK),
        ("xl/_rels/workbook.xml.rels", XLSX_WORKBOOK_RELS),
        ("xl/styles.xml", XLSX_STYLES),
        ("xl/worksheets/sheet1.xml", sheet.as_str()),
    ];
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in parts {
        writer
            .start_file(name, FileOptions::<()>::default())
            .expect("failed to start xlsx part");
        writer
            .write_all(contents.as_bytes())
            .expect("failed to write xlsx part");
    }

    writer.finish().expect("failed to finish xlsx").into_inner()
}

/// Encode text as GBK, the way Alipay writes its CSV exports.
pub fn gbk(text: &str) -> Vec<u8> {
    let (bytes, _, had_errors) = encoding_rs::GBK.encode(text);
    assert!(!had_errors, "text is not representable in GBK");
    bytes.into_owned()
}
