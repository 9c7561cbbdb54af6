use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::resolve::{CellValue, ResolvedRow};

pub const MAX_SHEET_NAME_CHARS: usize = 31;
pub const MAX_CELL_CHARS: usize = 32_767;
pub const MAX_ROWS: usize = 1_048_576;
pub const MAX_COLUMNS: usize = 16_384;
const FALLBACK_SHEET_NAME: &str = "Sheet1";

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("table of {rows} rows by {columns} columns does not fit in one worksheet")]
    TooLarge { rows: usize, columns: usize },
    #[error("failed to write workbook")]
    Xlsx(#[from] XlsxError),
}

/// Makes `name` acceptable as a worksheet name.
///
/// Forbidden characters become `_`, surrounding apostrophes are dropped and
/// the result is cut to 31 characters. An empty or reserved result falls back
/// to `Sheet1`.
pub fn sanitize_sheet_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    let trimmed: String = cleaned
        .trim_matches('\'')
        .chars()
        .take(MAX_SHEET_NAME_CHARS)
        .collect();
    let trimmed = trimmed.trim_end_matches('\'');
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("history") {
        String::from(FALLBACK_SHEET_NAME)
    } else {
        trimmed.to_owned()
    }
}

/// `data.sav` -> `data.xlsx`, whatever the input extension.
pub fn output_file_name(input: &Path) -> PathBuf {
    input.with_extension("xlsx")
}

fn clip(text: &str) -> &str {
    match text.char_indices().nth(MAX_CELL_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn write_cell(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    cell: &CellValue,
) -> Result<(), XlsxError> {
    match cell {
        CellValue::Numeric(x) if x.is_finite() => {
            sheet.write_number(row, col, *x)?;
        }
        CellValue::Numeric(x) => {
            sheet.write_string(row, col, x.to_string())?;
        }
        CellValue::Text(s) => {
            let clipped = clip(s);
            if clipped.len() < s.len() {
                let chars = s.chars().count();
                warn!(row, col, chars, "cell text truncated to the worksheet limit");
            }
            sheet.write_string(row, col, clipped)?;
        }
        CellValue::Empty => {}
    }
    Ok(())
}

/// Writes a single-sheet workbook: the header row, then the rows in order.
pub fn encode(
    headers: &[String],
    rows: &[ResolvedRow],
    sheet_name: &str,
) -> Result<Vec<u8>, EncodeError> {
    let columns = rows.iter().map(Vec::len).fold(headers.len(), usize::max);
    if rows.len() + 1 > MAX_ROWS || columns > MAX_COLUMNS {
        return Err(EncodeError::TooLarge {
            rows: rows.len() + 1,
            columns,
        });
    }

    let name = sanitize_sheet_name(sheet_name);
    if name != sheet_name {
        debug!(requested = sheet_name, used = %name, "sheet name adjusted");
    }

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(&name)?;

    for (col, header) in headers.iter().enumerate() {
        sheet.write_string(0, col as u16, clip(header))?;
    }
    for (i, row) in rows.iter().enumerate() {
        let r = (i + 1) as u32;
        for (col, cell) in row.iter().enumerate() {
            write_cell(sheet, r, col as u16, cell)?;
        }
    }

    let buf = workbook.save_to_buffer()?;
    debug!(rows = rows.len(), columns, bytes = buf.len(), "encoded workbook");
    Ok(buf)
}
