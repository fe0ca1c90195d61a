//! Tabular ingestion (CSV, Excel) and CSV export.

use crate::error::{TaxonomyError, TaxonomyResult};
use calamine::{open_workbook_from_rs, Data, Reader, Xls, Xlsb, Xlsx};
use std::collections::BTreeMap;
use std::io::Cursor;

/// One ingestion row: column header → cell text.
pub type Row = BTreeMap<String, String>;

/// Raw parsed sheet.
#[derive(Debug, Clone)]
pub struct RawSheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawSheet {
    /// Rows keyed by header. Missing trailing cells read as empty.
    pub fn records(&self) -> Vec<Row> {
        self.rows
            .iter()
            .map(|values| {
                self.headers
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| !h.is_empty())
                    .map(|(i, h)| (h.clone(), values.get(i).cloned().unwrap_or_default()))
                    .collect()
            })
            .collect()
    }
}

/// Dispatch file parsing by extension. Only the first worksheet is read.
pub fn parse_file(filename: &str, data: &[u8]) -> TaxonomyResult<RawSheet> {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "csv" => parse_csv(filename, data),
        "xlsx" | "xlsm" => {
            let workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(data))
                .map_err(|e| TaxonomyError::Format(format!("Failed to open Excel workbook: {}", e)))?;
            first_sheet(workbook)
        }
        "xls" => {
            let workbook: Xls<_> = open_workbook_from_rs(Cursor::new(data))
                .map_err(|e| TaxonomyError::Format(format!("Failed to open Excel workbook: {}", e)))?;
            first_sheet(workbook)
        }
        "xlsb" => {
            let workbook: Xlsb<_> = open_workbook_from_rs(Cursor::new(data))
                .map_err(|e| TaxonomyError::Format(format!("Failed to open Excel workbook: {}", e)))?;
            first_sheet(workbook)
        }
        _ => Err(TaxonomyError::Format(format!(
            "Expected a CSV or Excel file, but got '.{}' for file '{}'",
            ext, filename
        ))),
    }
}

fn parse_csv(filename: &str, data: &[u8]) -> TaxonomyResult<RawSheet> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(data);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| TaxonomyError::Format(format!("Failed to read CSV headers: {}", e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(TaxonomyError::Format("CSV file has no headers".to_string()));
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| TaxonomyError::Format(format!("Failed to read CSV record: {}", e)))?;
        let row: Vec<String> = record.iter().map(|f| f.to_string()).collect();
        if row.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        rows.push(row);
    }

    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim_end_matches(".csv")
        .to_string();

    Ok(RawSheet { name, headers, rows })
}

fn first_sheet<RS, R>(mut workbook: R) -> TaxonomyResult<RawSheet>
where
    RS: std::io::Read + std::io::Seek,
    R: Reader<RS>,
    R::Error: std::fmt::Display,
{
    let name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| TaxonomyError::Format("Workbook has no sheets".to_string()))?;

    let range = workbook
        .worksheet_range(&name)
        .map_err(|e| TaxonomyError::Format(format!("Failed to read sheet '{}': {}", name, e)))?;

    range_to_raw_sheet(&name, &range)
        .ok_or_else(|| TaxonomyError::Format(format!("Sheet '{}' has no header row", name)))
}

/// First row = headers. Fully empty rows are skipped.
fn range_to_raw_sheet(name: &str, range: &calamine::Range<Data>) -> Option<RawSheet> {
    let mut row_iter = range.rows();

    let header_row = row_iter.next()?;
    let headers: Vec<String> = header_row.iter().map(|c| cell_to_string(c).trim().to_string()).collect();

    if headers.iter().all(|h| h.is_empty()) {
        return None;
    }

    let rows = row_iter
        .map(|row| row.iter().map(cell_to_string).collect::<Vec<_>>())
        .filter(|values| !values.iter().all(|v| v.trim().is_empty()))
        .collect();

    Some(RawSheet {
        name: name.to_string(),
        headers,
        rows,
    })
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // Avoid trailing ".0" for whole numbers (record numbers, ids)
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                format!("{}", *f as i64)
            } else {
                format!("{}", f)
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

/// Write rows (each an ordered list of `(column, value)`) as CSV.
///
/// The header is taken from the first row's column names.
pub fn write_csv(rows: &[Vec<(&'static str, String)>]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if let Some(first) = rows.first() {
        writer.write_record(first.iter().map(|(column, _)| *column))?;
    }
    for row in rows {
        writer.write_record(row.iter().map(|(_, value)| value.as_str()))?;
    }
    writer.into_inner().map_err(|e| anyhow::anyhow!("Failed to flush CSV: {}", e))
}
