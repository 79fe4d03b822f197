//! Copies (or converts) the newest extracted bill file to a fixed name the normalizer reads.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use calamine::{open_workbook_auto, Data, DataType, Reader};
use thiserror::Error;
use walkdir::WalkDir;

use crate::platform::{PlatformAdapter, ARCHIVE_EXTENSION};

const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls", "ods"];
const CONVERTED_EXTENSION: &str = "csv";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum StageError {
    #[error("failed to search {0}: {1}")]
    SearchFailed(PathBuf, walkdir::Error),
    #[error("no extracted {platform} bill found in {}; expected a file starting with '{prefix}'", .dir.display())]
    NoBillFile {
        platform: &'static str,
        prefix: &'static str,
        dir: PathBuf,
    },
    #[error("failed to read spreadsheet {0}: {1}")]
    SpreadsheetFailed(PathBuf, calamine::Error),
    #[error("spreadsheet {0} has no worksheets")]
    EmptyWorkbook(PathBuf),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, csv::Error),
    #[error("failed to copy {0}: {1}")]
    CopyFailed(PathBuf, io::Error),
}

/// Find the newest bill file for the platform anywhere under `source_dir` and stage it in
/// `target_dir` as `{platform}_raw.{ext}`, replacing any previously staged file. Spreadsheets are
/// converted to UTF-8 CSV for platforms that need it.
///
/// # Errors
/// Returns a [`StageError`] if no file is found or it could not be converted or copied.
pub fn stage(
    source_dir: &Path,
    target_dir: &Path,
    adapter: &dyn PlatformAdapter,
) -> Result<PathBuf, StageError> {
    let source = newest_bill_file(source_dir, adapter)?;
    let extension = source
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let is_spreadsheet = SPREADSHEET_EXTENSIONS.contains(&extension.as_str());
    if adapter.needs_spreadsheet_conversion() && is_spreadsheet {
        let destination = staged_path(target_dir, adapter, CONVERTED_EXTENSION);
        convert_spreadsheet(&source, &destination)?;
        info!("Converted {} to {}", source.display(), destination.display());

        return Ok(destination);
    }

    let destination = staged_path(target_dir, adapter, &extension);
    fs::copy(&source, &destination).map_err(|err| StageError::CopyFailed(source.clone(), err))?;
    info!("Copied {} to {}", source.display(), destination.display());

    Ok(destination)
}

fn staged_path(target_dir: &Path, adapter: &dyn PlatformAdapter, extension: &str) -> PathBuf {
    let name = if extension.is_empty() {
        format!("{}_raw", adapter.id())
    } else {
        format!("{}_raw.{extension}", adapter.id())
    };

    target_dir.join(name)
}

fn newest_bill_file(
    source_dir: &Path,
    adapter: &dyn PlatformAdapter,
) -> Result<PathBuf, StageError> {
    let mut candidates = Vec::new();
    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|err| StageError::SearchFailed(source_dir.to_path_buf(), err))?;
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_file()
            && name.starts_with(adapter.bill_file_prefix())
            && !name.ends_with(ARCHIVE_EXTENSION)
        {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|metadata| metadata.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((entry.into_path(), modified));
        }
    }

    let mut newest: Option<(PathBuf, SystemTime)> = None;
    for (path, modified) in candidates {
        match &newest {
            Some((_, newest_modified)) if modified <= *newest_modified => {}
            _ => newest = Some((path, modified)),
        }
    }

    newest
        .map(|(path, _)| path)
        .ok_or_else(|| StageError::NoBillFile {
            platform: adapter.id(),
            prefix: adapter.bill_file_prefix(),
            dir: source_dir.to_path_buf(),
        })
}

/// Write the first worksheet of `source` to `destination` as UTF-8 CSV.
fn convert_spreadsheet(source: &Path, destination: &Path) -> Result<(), StageError> {
    let mut workbook = open_workbook_auto(source)
        .map_err(|err| StageError::SpreadsheetFailed(source.to_path_buf(), err))?;
    let first_sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| StageError::EmptyWorkbook(source.to_path_buf()))?;
    let range = workbook
        .worksheet_range(&first_sheet)
        .map_err(|err| StageError::SpreadsheetFailed(source.to_path_buf(), err))?;

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(destination)
        .map_err(|err| StageError::WriteFailed(destination.to_path_buf(), err))?;
    for row in range.rows() {
        writer
            .write_record(row.iter().map(render_cell))
            .map_err(|err| StageError::WriteFailed(destination.to_path_buf(), err))?;
    }

    writer
        .flush()
        .map_err(|err| StageError::WriteFailed(destination.to_path_buf(), err.into()))
}

fn render_cell(cell: &Data) -> String {
    match cell {
        Data::DateTime(_) => cell.as_datetime().map_or_else(
            || cell.to_string(),
            |datetime| datetime.format(DATETIME_FORMAT).to_string(),
        ),
        Data::Empty => String::new(),
        _ => cell.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{self, RecordNormalizer};
    use crate::platform::{AlipayAdapter, WechatpayAdapter};
    use crate::testutil::{self, Cell};
    use std::{fs::File, time::Duration};
    use test_case::test_case;

    fn write_with_mtime(path: &Path, contents: &[u8], seconds_since_epoch: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to make dir");
        }
        fs::write(path, contents).expect("failed to write file");
        File::options()
            .write(true)
            .open(path)
            .expect("failed to open file")
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(seconds_since_epoch))
            .expect("failed to set modification time");
    }

    #[test]
    fn test_stages_newest_file_from_any_depth() {
        let source = tempfile::tempdir().expect("failed to make tempdir");
        let target = tempfile::tempdir().expect("failed to make tempdir");
        write_with_mtime(&source.path().join("支付宝交易明细(old).csv"), b"old", 1_000);
        write_with_mtime(
            &source.path().join("nested").join("支付宝交易明细(new).csv"),
            b"new",
            2_000,
        );
        write_with_mtime(&source.path().join("支付宝交易明细(newest).zip"), b"zip", 3_000);
        write_with_mtime(&source.path().join("unrelated.csv"), b"other", 4_000);

        let staged = stage(source.path(), target.path(), &AlipayAdapter::new())
            .expect("failed to stage");

        assert_eq!(target.path().join("alipay_raw.csv"), staged);
        assert_eq!(b"new".to_vec(), fs::read(staged).expect("failed to read staged file"));
    }

    #[test]
    fn test_staging_overwrites_previous_file() {
        let source = tempfile::tempdir().expect("failed to make tempdir");
        let target = tempfile::tempdir().expect("failed to make tempdir");
        fs::write(target.path().join("alipay_raw.csv"), "stale").expect("failed to write file");
        write_with_mtime(&source.path().join("支付宝交易明细.csv"), b"fresh", 1_000);

        let staged = stage(source.path(), target.path(), &AlipayAdapter::new())
            .expect("failed to stage");

        assert_eq!("fresh", fs::read_to_string(staged).expect("failed to read staged file"));
    }

    #[test]
    fn test_delimited_exports_are_not_converted() {
        let source = tempfile::tempdir().expect("failed to make tempdir");
        let target = tempfile::tempdir().expect("failed to make tempdir");
        write_with_mtime(&source.path().join("微信支付账单.csv"), b"a,b", 1_000);

        let staged = stage(source.path(), target.path(), &WechatpayAdapter::new())
            .expect("failed to stage");

        assert_eq!(target.path().join("wechatpay_raw.csv"), staged);
    }

    #[test]
    fn test_missing_bill_names_the_prefix() {
        let source = tempfile::tempdir().expect("failed to make tempdir");
        let target = tempfile::tempdir().expect("failed to make tempdir");

        let err = stage(source.path(), target.path(), &WechatpayAdapter::new())
            .expect_err("should fail");

        assert!(matches!(err, StageError::NoBillFile { platform: "wechatpay", .. }));
        assert!(err.to_string().contains("微信支付账单"));
    }

    #[test]
    fn test_corrupt_spreadsheet_is_an_error() {
        let source = tempfile::tempdir().expect("failed to make tempdir");
        let target = tempfile::tempdir().expect("failed to make tempdir");
        write_with_mtime(&source.path().join("微信支付账单.xlsx"), b"not a spreadsheet", 1_000);

        let err = stage(source.path(), target.path(), &WechatpayAdapter::new())
            .expect_err("should fail");

        assert!(matches!(err, StageError::SpreadsheetFailed(..)));
    }

    fn wechat_workbook() -> Vec<u8> {
        let header = [
            "交易时间", "交易类型", "交易对方", "商品", "收/支", "金额(元)", "支付方式", "当前状态",
            "交易单号", "商户单号", "备注",
        ];
        testutil::xlsx_bytes(&[
            vec![Cell::Text("微信支付账单明细")],
            vec![Cell::Text("微信昵称：[张三]")],
            header.iter().map(|&name| Cell::Text(name)).collect(),
            vec![
                Cell::DateTime(44928.5),
                Cell::Text("商户消费"),
                Cell::Text("某咖啡店"),
                Cell::Text("拿铁"),
                Cell::Text("支出"),
                Cell::Text("¥12.50"),
                Cell::Text("零钱"),
                Cell::Text("支付成功"),
                Cell::Text("4200001"),
                Cell::Number(10001.0),
                Cell::Text("/"),
            ],
        ])
    }

    fn stage_wechat_workbook(source: &Path, target: &Path) -> PathBuf {
        write_with_mtime(
            &source.join("微信支付账单(20230101-20230131).xlsx"),
            &wechat_workbook(),
            1_000,
        );

        stage(source, target, &WechatpayAdapter::new()).expect("failed to stage")
    }

    #[test]
    fn test_wechat_spreadsheet_is_converted_to_csv() {
        let source = tempfile::tempdir().expect("failed to make tempdir");
        let target = tempfile::tempdir().expect("failed to make tempdir");

        let staged = stage_wechat_workbook(source.path(), target.path());

        assert_eq!(target.path().join("wechatpay_raw.csv"), staged);
        let expected = textwrap::dedent(
            "
            微信支付账单明细,,,,,,,,,,
            微信昵称：[张三],,,,,,,,,,
            交易时间,交易类型,交易对方,商品,收/支,金额(元),支付方式,当前状态,交易单号,商户单号,备注
            2023-01-02 12:00:00,商户消费,某咖啡店,拿铁,支出,¥12.50,零钱,支付成功,4200001,10001,/
            ",
        );
        let contents = fs::read_to_string(staged).expect("failed to read staged file");
        assert_eq!(
            expected.trim().lines().collect::<Vec<_>>(),
            contents.lines().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_converted_wechat_export_normalizes() {
        let source = tempfile::tempdir().expect("failed to make tempdir");
        let target = tempfile::tempdir().expect("failed to make tempdir");
        let adapter = WechatpayAdapter::new();

        let staged = stage_wechat_workbook(source.path(), target.path());
        let rows = normalize::read_bill_table(&staged, &adapter).expect("failed to read table");
        let records = RecordNormalizer::default()
            .normalize(rows, &adapter)
            .expect("failed to normalize");

        assert_eq!(1, records.len());
        assert_eq!("2023-01-02T12:00:00Z", records[0].datetime);
        assert!((records[0].amount - 12.5).abs() < f64::EPSILON);
        assert_eq!("拿铁", records[0].content);
        assert_eq!("", records[0].remarks);
        assert_eq!("10001", records[0].merchant_order_id);
        assert_eq!("WeChatPay", records[0].source_platform);
    }

    #[test_case(Data::String("商品".to_string()), "商品"; "text")]
    #[test_case(Data::Float(12.5), "12.5"; "float")]
    #[test_case(Data::Int(3), "3"; "integer")]
    #[test_case(Data::Empty, ""; "empty")]
    fn test_render_cell(cell: Data, expected: &str) {
        assert_eq!(expected, render_cell(&cell));
    }
}
