//! Reads uploaded spreadsheet bytes into a [`RawSheet`] and works out which
//! row is the header, which leading rows are metadata and which trailing rows
//! are totals.
//!
//! Row classification is a handful of small predicates over [`RowShape`]
//! rather than one scoring function, so each rule can be tested on its own.

use crate::config::PipelineConfig;
use crate::error::{Result, RoyaltyError};
use crate::utils::{excel_serial_to_date, parse_amount, parse_date};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::NaiveDate;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::str::FromStr;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

const SUMMARY_TOKENS: [&str; 5] = ["total", "totals", "subtotal", "subtotals", "summary"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetFormat {
    /// Zipped XML workbook
    Xlsx,
    /// Legacy binary (OLE2) workbook
    Xls,
    Csv,
}

impl SheetFormat {
    /// Sniffs the container from magic bytes. Anything that is not a workbook is read as text.
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(ZIP_MAGIC) {
            SheetFormat::Xlsx
        } else if bytes.starts_with(OLE_MAGIC) {
            SheetFormat::Xls
        } else {
            SheetFormat::Csv
        }
    }

    /// The format the filename claims to be, if it names a known one.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let mime = mime_guess::from_path(filename).first()?;
        match mime.essence_str() {
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                Some(SheetFormat::Xlsx)
            }
            "application/vnd.ms-excel" => Some(SheetFormat::Xls),
            "text/csv" | "text/plain" | "text/tab-separated-values" => Some(SheetFormat::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Cell {
    Empty,
    Text(String),
    Number(Decimal),
    Date(NaiveDate),
}

impl Cell {
    /// Classifies a text cell: money-like text becomes a number, date-like text a date.
    pub fn from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Cell::Empty
        } else if let Some(amount) = parse_amount(trimmed) {
            Cell::Number(amount)
        } else if let Some(date) = parse_date(trimmed) {
            Cell::Date(date)
        } else {
            Cell::Text(trimmed.to_string())
        }
    }

    fn from_data(data: &Data) -> Self {
        match data {
            Data::Empty | Data::Error(_) => Cell::Empty,
            Data::String(s) => Cell::from_text(s),
            Data::Int(i) => Cell::Number(Decimal::from(*i)),
            Data::Float(f) => decimal_from_f64(*f).map_or(Cell::Empty, Cell::Number),
            Data::Bool(b) => Cell::Text(b.to_string()),
            Data::DateTime(dt) => excel_serial_to_date(dt.as_f64()).map_or(Cell::Empty, Cell::Date),
            Data::DateTimeIso(s) => parse_date(s).map_or_else(|| Cell::Text(s.clone()), Cell::Date),
            Data::DurationIso(s) => Cell::Text(s.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn display(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => n.normalize().to_string(),
            Cell::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

fn decimal_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    // Display gives the shortest representation that round-trips, so 0.1 stays 0.1.
    Decimal::from_str(&value.to_string()).ok()
}

/// Populated/text/number counts for one row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowShape {
    pub populated: usize,
    pub strings: usize,
    pub numbers: usize,
    pub dates: usize,
}

impl RowShape {
    pub fn of(row: &[Cell]) -> Self {
        let mut shape = RowShape::default();
        for cell in row {
            match cell {
                Cell::Empty => continue,
                Cell::Text(_) => shape.strings += 1,
                Cell::Number(_) => shape.numbers += 1,
                Cell::Date(_) => shape.dates += 1,
            }
            shape.populated += 1;
        }
        shape
    }

    pub fn is_blank(&self) -> bool {
        self.populated == 0
    }
}

/// A `Label: value` pair, the classic shape of a report preamble line.
pub fn is_key_value_row(row: &[Cell]) -> bool {
    let populated: Vec<&Cell> = row.iter().filter(|c| !c.is_empty()).collect();
    match populated.first() {
        Some(Cell::Text(label)) if populated.len() <= 2 => label.trim_end().ends_with(':'),
        _ => false,
    }
}

/// Too few populated cells to be a header, and not shaped like one.
pub fn is_metadata_row(row: &[Cell]) -> bool {
    let shape = RowShape::of(row);
    if shape.populated == 1 {
        return true;
    }
    (1..=2).contains(&shape.populated) && (shape.strings < 2 || is_key_value_row(row))
}

/// The first non-empty cell names a total/subtotal/summary.
pub fn is_summary_row(row: &[Cell]) -> bool {
    let Some(first) = row.iter().find(|c| !c.is_empty()) else {
        return false;
    };
    let label = first.display().to_lowercase();
    label
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| SUMMARY_TOKENS.contains(&token))
}

/// Carries at least one number and is not a preamble-style pair.
///
/// This is the loose test used to confirm a header; rows below the header are
/// held to the sheet's [`DataProfile`] as well.
pub fn is_data_shaped(row: &[Cell]) -> bool {
    let shape = RowShape::of(row);
    shape.numbers >= 1 && !is_key_value_row(row) && !is_summary_row(row)
}

const PROFILE_ROWS: usize = 5;

/// The columns a sheet's data rows fill, learned from the rows right under the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataProfile {
    /// Filled in at least half of the profiled rows
    pub expected: Vec<usize>,
    /// Numeric in at least half of the profiled rows
    pub numeric: Vec<usize>,
}

impl DataProfile {
    pub fn learn(rows: &[Vec<Cell>], header_row_index: usize) -> Self {
        let block: Vec<&Vec<Cell>> = rows
            .iter()
            .skip(header_row_index + 1)
            .filter(|r| !RowShape::of(r).is_blank())
            .take_while(|r| is_data_shaped(r))
            .take(PROFILE_ROWS)
            .collect();
        let width = block.iter().map(|r| r.len()).max().unwrap_or(0);

        let mut profile = DataProfile::default();
        for col in 0..width {
            let filled = block
                .iter()
                .filter(|r| r.get(col).is_some_and(|c| !c.is_empty()))
                .count();
            let numbers = block
                .iter()
                .filter(|r| matches!(r.get(col), Some(Cell::Number(_))))
                .count();
            if filled > 0 && filled * 2 >= block.len() {
                profile.expected.push(col);
            }
            if numbers > 0 && numbers * 2 >= block.len() {
                profile.numeric.push(col);
            }
        }
        profile
    }

    /// Expected cells a data row may leave blank. None once the data block has ended.
    fn tolerance(&self, block_ended: bool) -> usize {
        if block_ended {
            0
        } else {
            self.expected.len().saturating_sub(1) / 3
        }
    }

    /// Numbers in at least half of the numeric columns, and the expected columns filled.
    pub fn fits(&self, row: &[Cell], block_ended: bool) -> bool {
        if !is_data_shaped(row) {
            return false;
        }
        let numbers = self
            .numeric
            .iter()
            .filter(|&&c| matches!(row.get(c), Some(Cell::Number(_))))
            .count();
        let missing = self
            .expected
            .iter()
            .filter(|&&c| row.get(c).map_or(true, Cell::is_empty))
            .count();
        numbers > 0 && numbers * 2 >= self.numeric.len() && missing <= self.tolerance(block_ended)
    }
}

fn is_header_candidate(row: &[Cell], min_strings: usize, widest: usize) -> bool {
    let shape = RowShape::of(row);
    shape.populated >= 2
        && shape.strings >= min_strings
        && shape.numbers < shape.strings
        && shape.populated * 2 > widest
        && !is_metadata_row(row)
        && !is_summary_row(row)
}

/// Index of the header row: the first candidate whose next populated row is data.
pub fn detect_header(rows: &[Vec<Cell>], config: &PipelineConfig) -> Result<usize> {
    let window = rows.len().min(config.header_scan_rows);
    let widest = rows
        .iter()
        .map(|r| RowShape::of(r).populated)
        .max()
        .unwrap_or(0);

    for idx in 0..window {
        if !is_header_candidate(&rows[idx], config.min_header_string_cells, widest) {
            continue;
        }
        let next = rows[idx + 1..]
            .iter()
            .find(|r| !RowShape::of(r).is_blank());
        match next {
            Some(row) if is_data_shaped(row) => {
                debug!("Header detected at row {}", idx);
                return Ok(idx);
            }
            _ => debug!("Row {} looks like a header but is not followed by data", idx),
        }
    }

    Err(RoyaltyError::HeaderNotFound { scanned: window })
}

/// The extractor's output: raw cells plus the row classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSheet {
    pub sheet_name: Option<String>,
    pub format: SheetFormat,
    pub encoding: Option<String>,
    pub rows: Vec<Vec<Cell>>,
    /// Unique column names, in sheet order
    pub columns: Vec<String>,
    pub header_row_index: usize,
    pub metadata_rows: Vec<usize>,
    pub summary_rows: Vec<usize>,
    /// Non-blank rows below the header that are neither data nor totals
    pub text_rows: Vec<usize>,
    pub data_row_indices: Vec<usize>,
    pub total_rows: usize,
    pub data_rows: usize,
}

impl RawSheet {
    /// Classifies an already-decoded grid.
    pub fn from_grid(
        sheet_name: Option<String>,
        format: SheetFormat,
        rows: Vec<Vec<Cell>>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let header_row_index = detect_header(&rows, config)?;

        let metadata_rows: Vec<usize> = (0..header_row_index)
            .filter(|&i| !RowShape::of(&rows[i]).is_blank())
            .collect();

        let profile = DataProfile::learn(&rows, header_row_index);
        let mut summary_rows = Vec::new();
        let mut text_rows = Vec::new();
        let mut data_row_indices = Vec::new();
        let mut block_ended = false;
        for (idx, row) in rows.iter().enumerate().skip(header_row_index + 1) {
            if RowShape::of(row).is_blank() {
                continue;
            }
            if is_summary_row(row) {
                summary_rows.push(idx);
                block_ended = true;
            } else if profile.fits(row, block_ended) {
                data_row_indices.push(idx);
            } else {
                text_rows.push(idx);
                block_ended = true;
            }
        }

        let width = std::iter::once(header_row_index)
            .chain(data_row_indices.iter().copied())
            .map(|i| rows[i].len())
            .max()
            .unwrap_or(0);
        let columns = column_names(&rows[header_row_index], width);

        let sheet = RawSheet {
            sheet_name,
            format,
            encoding: None,
            total_rows: rows.len(),
            data_rows: data_row_indices.len(),
            rows,
            columns,
            header_row_index,
            metadata_rows,
            summary_rows,
            text_rows,
            data_row_indices,
        };
        debug!(
            "Sheet classified: header row {}, {} metadata, {} data, {} summary, {} text rows",
            sheet.header_row_index,
            sheet.metadata_rows.len(),
            sheet.data_rows,
            sheet.summary_rows.len(),
            sheet.text_rows.len()
        );
        Ok(sheet)
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        static EMPTY: Cell = Cell::Empty;
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&EMPTY)
    }

    pub fn iter_data_rows(&self) -> impl Iterator<Item = (usize, &Vec<Cell>)> {
        self.data_row_indices.iter().map(move |&i| (i, &self.rows[i]))
    }

    /// Up to `limit` non-empty values per column, from the first data rows.
    pub fn column_samples(&self, limit: usize) -> BTreeMap<String, Vec<String>> {
        self.columns
            .iter()
            .enumerate()
            .map(|(col, name)| {
                let values = self
                    .data_row_indices
                    .iter()
                    .map(|&row| self.cell(row, col))
                    .filter(|c| !c.is_empty())
                    .take(limit)
                    .map(Cell::display)
                    .collect();
                (name.clone(), values)
            })
            .collect()
    }

    /// Distinct non-empty values in a column across data rows, first spelling wins.
    pub fn distinct_values(&self, column: &str) -> Vec<String> {
        let Some(col) = self.column_index(column) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for &row in &self.data_row_indices {
            let value = self.cell(row, col).display();
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            if seen.insert(value.to_lowercase()) {
                values.push(value.to_string());
            }
        }
        values
    }

    /// Rows below the header that hold numbers but were left out as notes.
    pub fn excluded_numeric_rows(&self) -> Vec<usize> {
        self.text_rows
            .iter()
            .copied()
            .filter(|&i| RowShape::of(&self.rows[i]).numbers > 0)
            .collect()
    }

    /// Free text around the table (preamble and trailing notes).
    pub fn hint_text(&self) -> String {
        self.metadata_rows
            .iter()
            .chain(self.text_rows.iter())
            .map(|&i| {
                self.rows[i]
                    .iter()
                    .filter(|c| !c.is_empty())
                    .map(Cell::display)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn preview_rows(&self, limit: usize) -> Vec<Vec<String>> {
        self.data_row_indices
            .iter()
            .take(limit)
            .map(|&row| {
                (0..self.columns.len())
                    .map(|col| self.cell(row, col).display())
                    .collect()
            })
            .collect()
    }
}

fn column_names(header: &[Cell], width: usize) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut names = Vec::with_capacity(width);
    for col in 0..width {
        let base = header
            .get(col)
            .map(|c| c.display().split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("Column {}", col + 1));
        let mut name = base.clone();
        let mut n = 2;
        while !seen.insert(name.clone()) {
            name = format!("{} ({})", base, n);
            n += 1;
        }
        names.push(name);
    }
    names
}

/// Reads and classifies an uploaded file.
///
/// Only two conditions are fatal here: bytes that cannot be read as a
/// spreadsheet, and no header row in the scan window.
pub fn extract(bytes: &[u8], filename: &str, config: &PipelineConfig) -> Result<RawSheet> {
    let format = SheetFormat::sniff(bytes);
    if let Some(declared) = SheetFormat::from_filename(filename) {
        if declared != format {
            warn!(
                "'{}' is named as {:?} but its contents read as {:?}",
                filename, declared, format
            );
        }
    }
    info!("Extracting '{}' ({:?}, {} bytes)", filename, format, bytes.len());

    match format {
        SheetFormat::Xlsx | SheetFormat::Xls => extract_workbook(bytes, filename, format, config),
        SheetFormat::Csv => extract_csv(bytes, filename, config),
    }
}

fn extract_workbook(
    bytes: &[u8],
    filename: &str,
    format: SheetFormat,
    config: &PipelineConfig,
) -> Result<RawSheet> {
    let unreadable = |details: String| RoyaltyError::UnreadableFile {
        filename: filename.to_string(),
        details,
    };

    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(bytes)).map_err(|e| unreadable(e.to_string()))?;

    let mut last_error = None;
    let mut any_sheet = false;
    for name in workbook.sheet_names() {
        let range = match workbook.worksheet_range(&name) {
            Ok(range) => range,
            Err(e) => {
                warn!("Skipping sheet '{}': {}", name, e);
                continue;
            }
        };
        any_sheet = true;

        // Ranges start at the first used cell; pad back to absolute positions.
        let (row_offset, col_offset) = range
            .start()
            .map(|(r, c)| (r as usize, c as usize))
            .unwrap_or((0, 0));
        let mut grid: Vec<Vec<Cell>> = vec![Vec::new(); row_offset];
        for row in range.rows() {
            let mut cells = vec![Cell::Empty; col_offset];
            cells.extend(row.iter().map(Cell::from_data));
            grid.push(cells);
        }

        match RawSheet::from_grid(Some(name.clone()), format, grid, config) {
            Ok(sheet) => return Ok(sheet),
            Err(e) => {
                debug!("Sheet '{}' has no usable table: {}", name, e);
                last_error = Some(e);
            }
        }
    }

    if !any_sheet {
        return Err(unreadable("workbook contains no readable worksheets".into()));
    }
    Err(last_error.unwrap_or(RoyaltyError::HeaderNotFound { scanned: 0 }))
}

/// Decodes CSV bytes: BOM-declared encoding, then UTF-8, then Windows-1252.
pub fn decode_text(bytes: &[u8]) -> (String, &'static str) {
    if let Some((encoding, _)) = encoding_rs::Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_with_bom_removal(bytes);
        return (text.into_owned(), encoding.name());
    }

    let (text, had_errors) = encoding_rs::UTF_8.decode_without_bom_handling(bytes);
    if !had_errors {
        return (text.into_owned(), encoding_rs::UTF_8.name());
    }

    debug!("Input is not valid UTF-8, falling back to windows-1252");
    let (text, _) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes);
    (text.into_owned(), encoding_rs::WINDOWS_1252.name())
}

fn sniff_delimiter(text: &str) -> u8 {
    let sample: Vec<&str> = text.lines().take(30).collect();
    [b',', b';', b'\t']
        .into_iter()
        .max_by_key(|d| {
            sample
                .iter()
                .map(|line| line.bytes().filter(|b| b == d).count())
                .sum::<usize>()
        })
        .unwrap_or(b',')
}

fn extract_csv(bytes: &[u8], filename: &str, config: &PipelineConfig) -> Result<RawSheet> {
    let (text, encoding) = decode_text(bytes);
    let delimiter = sniff_delimiter(&text);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| RoyaltyError::UnreadableFile {
            filename: filename.to_string(),
            details: e.to_string(),
        })?;
        grid.push(record.iter().map(Cell::from_text).collect());
    }

    let mut sheet = RawSheet::from_grid(None, SheetFormat::Csv, grid, config)?;
    sheet.encoding = Some(encoding.to_string());
    Ok(sheet)
}
