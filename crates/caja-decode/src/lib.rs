//! Spreadsheet decoding for the portal exports + file-name identity recovery.

use std::path::Path;

use calamine::{open_workbook_auto, Data, DataType, Reader};
use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

pub const CRATE_NAME: &str = "caja-decode";

/// Row index of the column-name row in every export; data starts right below.
/// The three rows above it are the portal's banner block.
pub const HEADER_ROW: usize = 3;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("reading workbook {path}: {source}")]
    Workbook {
        path: String,
        #[source]
        source: calamine::Error,
    },
    #[error("workbook has no worksheets")]
    NoWorksheet,
    #[error("export has {rows} rows, not enough for the banner block plus headers and data")]
    TooShort { rows: usize },
    #[error("header row is empty")]
    EmptyHeader,
    #[error("required column {0:?} not found in header row")]
    MissingColumn(&'static str),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("file name {0:?} is not valid UTF-8")]
    NotText(String),
    #[error("file name {0:?} does not end in a DD_MM_YYYY capture date")]
    MissingDate(String),
    #[error("file name {0:?} has no branch segment before the capture date")]
    MissingBranch(String),
    #[error("file name {stem:?} carries impossible capture date {dd}/{mm}/{yyyy}")]
    BadDate {
        stem: String,
        dd: String,
        mm: String,
        yyyy: String,
    },
}

/// Owned cell value, converted out of the reader's types at the I/O boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Timestamp(NaiveDateTime),
    Empty,
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Textual form. Whole numbers print without a trailing `.0` so article
    /// codes that arrive as floats stay usable as keys.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Cell::Text(text) => Some(text.clone()),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Some(format!("{}", *n as i64))
            }
            Cell::Number(n) => Some(n.to_string()),
            Cell::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::Empty => None,
        }
    }

    /// Numeric form, applying the decimal-comma rule to text cells.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(text) => caja_core::parse_decimal(text),
            _ => None,
        }
    }
}

fn cell_from_calamine(data: &Data) -> Cell {
    if data.is_empty() {
        return Cell::Empty;
    }
    if data.is_datetime() {
        if let Some(ts) = data.as_datetime() {
            return Cell::Timestamp(ts);
        }
    }
    // String cells never go through as_f64: codes like "0330" must keep
    // their text form.
    if !data.is_string() {
        if let Some(n) = data.as_f64() {
            return Cell::Number(n);
        }
    }
    match data.as_string() {
        Some(text) if !text.trim().is_empty() => Cell::Text(text.trim().to_string()),
        _ => Cell::Empty,
    }
}

/// Read the first worksheet of an `.xls`/`.xlsx` file into an owned grid
/// anchored at cell A1.
pub fn read_grid(path: &Path) -> Result<Vec<Vec<Cell>>, DecodeError> {
    let mut workbook = open_workbook_auto(path).map_err(|source| DecodeError::Workbook {
        path: path.display().to_string(),
        source,
    })?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(DecodeError::NoWorksheet)?
        .map_err(|source| DecodeError::Workbook {
            path: path.display().to_string(),
            source,
        })?;

    // The reader's range starts at the first used cell; pad back to A1 so the
    // fixed row/column positions below stay meaningful.
    let (first_row, first_col) = match range.start() {
        Some((row, col)) => (row as usize, col as usize),
        None => return Ok(Vec::new()),
    };
    let mut grid: Vec<Vec<Cell>> = Vec::with_capacity(first_row + range.height());
    grid.resize_with(first_row, Vec::new);
    for row in range.rows() {
        let mut cells: Vec<Cell> = Vec::with_capacity(first_col + row.len());
        cells.resize_with(first_col, || Cell::Empty);
        cells.extend(row.iter().map(cell_from_calamine));
        grid.push(cells);
    }
    Ok(grid)
}

/// A decoded export with the banner block stripped: named headers plus the
/// data rows below them.
#[derive(Debug, Clone)]
pub struct SheetTable {
    headers: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl SheetTable {
    pub fn from_grid(mut grid: Vec<Vec<Cell>>) -> Result<Self, DecodeError> {
        if grid.len() <= HEADER_ROW + 1 {
            return Err(DecodeError::TooShort { rows: grid.len() });
        }
        let headers: Vec<String> = grid[HEADER_ROW]
            .iter()
            .map(|cell| cell.to_text().unwrap_or_default())
            .collect();
        if headers.iter().all(|header| header.trim().is_empty()) {
            return Err(DecodeError::EmptyHeader);
        }
        let rows = grid.split_off(HEADER_ROW + 1);
        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    fn find_column(&self, names: &[&str]) -> Option<usize> {
        self.headers.iter().position(|header| {
            let header = header.trim().to_lowercase();
            names.iter().any(|name| header == *name)
        })
    }

    fn find_column_containing(&self, fragment: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|header| header.to_lowercase().contains(fragment))
    }
}

fn cell_at<'a>(row: &'a [Cell], idx: Option<usize>) -> Option<&'a Cell> {
    idx.and_then(|i| row.get(i)).filter(|cell| !cell.is_empty())
}

fn text_at(row: &[Cell], idx: Option<usize>) -> Option<String> {
    cell_at(row, idx).and_then(|cell| cell.to_text())
}

fn number_at(row: &[Cell], idx: Option<usize>) -> Option<f64> {
    cell_at(row, idx).and_then(|cell| cell.to_number())
}

/// Catalog row as decoded, before the branch tag is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRow {
    pub familia: Option<String>,
    pub codigo: String,
    pub articulo: String,
}

/// Shape a consumos export. The catalog lives in the first three columns
/// (familia, code, article); rows missing a code or an article name are
/// portal padding and get dropped.
pub fn catalog_rows(table: &SheetTable) -> Vec<CatalogRow> {
    table
        .rows()
        .iter()
        .filter_map(|row| {
            let codigo = text_at(row, Some(1))?;
            let articulo = text_at(row, Some(2))?;
            Some(CatalogRow {
                familia: text_at(row, Some(0)),
                codigo,
                articulo,
            })
        })
        .collect()
}

/// Detail line as decoded: branch still unknown, close stamp still raw.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailRow {
    pub numero: String,
    pub tipo: Option<String>,
    pub mesa: Option<String>,
    pub mozo: Option<String>,
    pub nombre: Option<String>,
    pub codigo: String,
    pub descripcion: Option<String>,
    pub cantidad: Option<f64>,
    pub importe: Option<f64>,
    pub cierre: Option<Cell>,
}

/// Shape a tickets-detalle export. Columns are resolved by header name so the
/// portal may reorder them; rows without a ticket number are dropped. The
/// export's own Sucursal column is ignored, the branch comes from the file
/// name instead.
pub fn detail_rows(table: &SheetTable) -> Result<Vec<DetailRow>, DecodeError> {
    let col_numero = table
        .find_column(&["número", "numero"])
        .ok_or(DecodeError::MissingColumn("Número"))?;
    let col_codigo = table
        .find_column(&["código", "codigo"])
        .ok_or(DecodeError::MissingColumn("Código"))?;
    let col_tipo = table.find_column(&["tipo"]);
    let col_mesa = table.find_column(&["mesa"]);
    let col_mozo = table.find_column(&["mozo"]);
    let col_nombre = table.find_column(&["nombre"]);
    let col_descripcion = table.find_column(&["descripción", "descripcion"]);
    let col_cantidad = table.find_column(&["cantidad"]);
    let col_importe = table.find_column(&["importe"]);
    // The close-stamp header varies across portal versions ("F.Cierre",
    // "Fecha Cierre"), so match on the fragment.
    let col_cierre = table.find_column_containing("cierre");

    Ok(table
        .rows()
        .iter()
        .filter_map(|row| {
            let numero = text_at(row, Some(col_numero))?;
            Some(DetailRow {
                numero,
                tipo: text_at(row, col_tipo),
                mesa: text_at(row, col_mesa),
                mozo: text_at(row, col_mozo),
                nombre: text_at(row, col_nombre),
                codigo: text_at(row, Some(col_codigo)).unwrap_or_default(),
                descripcion: text_at(row, col_descripcion),
                cantidad: number_at(row, col_cantidad),
                importe: number_at(row, col_importe),
                cierre: cell_at(row, col_cierre).cloned(),
            })
        })
        .collect())
}

/// Audit-log row: ticket number plus the shift label that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRow {
    pub numero: String,
    pub turno: Option<String>,
}

/// Shape a cinta-testigo export. Needs the ticket number and TURNO columns;
/// rows without a number are dropped, rows without a shift are kept so the
/// caller can count them.
pub fn audit_rows(table: &SheetTable) -> Result<Vec<AuditRow>, DecodeError> {
    let col_numero = table
        .find_column(&["número", "numero"])
        .ok_or(DecodeError::MissingColumn("Número"))?;
    let col_turno = table
        .find_column(&["turno"])
        .ok_or(DecodeError::MissingColumn("TURNO"))?;

    Ok(table
        .rows()
        .iter()
        .filter_map(|row| {
            let numero = text_at(row, Some(col_numero))?;
            Some(AuditRow {
                numero,
                turno: text_at(row, Some(col_turno)),
            })
        })
        .collect())
}

/// Identity recovered from an export file name: which branch, captured when.
///
/// Understood shapes, all underscore-separated:
/// `consumos_BRANCH_DD_MM_YYYY`, `tickets_detalle_BRANCH_DD_MM_YYYY_HH_MM_SS`
/// and the portal's bare `BRANCH_DD_MM_YYYY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTag {
    pub sucursal: String,
    pub captured_on: NaiveDate,
}

impl SourceTag {
    pub fn from_path(path: &Path) -> Result<Self, IdentityError> {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| IdentityError::NotText(path.display().to_string()))?;
        Self::from_stem(stem)
    }

    pub fn from_stem(stem: &str) -> Result<Self, IdentityError> {
        let tokens: Vec<&str> = stem.split('_').filter(|t| !t.is_empty()).collect();
        let body: &[&str] = match tokens.first() {
            Some(first) if first.eq_ignore_ascii_case("consumos") => &tokens[1..],
            Some(first) if first.eq_ignore_ascii_case("tickets") => {
                if tokens.get(1).is_some_and(|t| t.eq_ignore_ascii_case("detalle")) {
                    &tokens[2..]
                } else {
                    &tokens[1..]
                }
            }
            _ => &tokens[..],
        };

        let numeric_tail = body
            .iter()
            .rev()
            .take_while(|t| t.bytes().all(|b| b.is_ascii_digit()))
            .count();
        // Six trailing numbers means a capture time follows the date.
        let (branch_tokens, date_tokens) = if numeric_tail >= 6 {
            (&body[..body.len() - 6], &body[body.len() - 6..body.len() - 3])
        } else if numeric_tail >= 3 {
            (&body[..body.len() - 3], &body[body.len() - 3..])
        } else {
            return Err(IdentityError::MissingDate(stem.to_string()));
        };
        if branch_tokens.is_empty() {
            return Err(IdentityError::MissingBranch(stem.to_string()));
        }

        let (dd, mm, yyyy) = (date_tokens[0], date_tokens[1], date_tokens[2]);
        let captured_on = dd
            .parse::<u32>()
            .ok()
            .zip(mm.parse::<u32>().ok())
            .zip(yyyy.parse::<i32>().ok())
            .and_then(|((d, m), y)| NaiveDate::from_ymd_opt(y, m, d))
            .ok_or_else(|| IdentityError::BadDate {
                stem: stem.to_string(),
                dd: dd.to_string(),
                mm: mm.to_string(),
                yyyy: yyyy.to_string(),
            })?;

        Ok(Self {
            sucursal: caja_core::canonical_branch(&branch_tokens.join("_")),
            captured_on,
        })
    }
}
