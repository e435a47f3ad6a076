//! Core domain model for CAJA: branch sales rows and their natural keys.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "caja-core";

/// Storage timestamp format for `Fecha_Carga` (UTC, lexicographically sortable).
pub const FECHA_CARGA_FMT: &str = "%Y-%m-%d %H:%M:%S";
/// Stored `Fecha` column format.
pub const FECHA_FMT: &str = "%Y-%m-%d";
/// Stored `Hora` column format.
pub const HORA_FMT: &str = "%H:%M:%S";
/// Operator-facing timestamp used by the status file and the execution log.
pub const MOMENTO_OPERADOR_FMT: &str = "%d/%m/%Y %H:%M:%S";

/// Export category produced by the portal, one drop folder each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Catalog export (familia / código / artículo), per branch.
    Consumos,
    /// Ticket line detail export, per branch.
    Detalle,
    /// Audit-log export ("cinta testigo"), portal-wide.
    Cinta,
}

impl Category {
    pub fn folder_name(self) -> &'static str {
        match self {
            Category::Consumos => "Consumos",
            Category::Detalle => "Detalle",
            Category::Cinta => "Cinta",
        }
    }
}

/// One catalog row, already tagged with the branch its file came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub familia: Option<String>,
    pub codigo: String,
    pub articulo: String,
    pub sucursal: String,
}

impl CatalogEntry {
    pub fn key(&self) -> CatalogKey {
        CatalogKey {
            codigo: self.codigo.clone(),
            articulo: self.articulo.clone(),
            sucursal: self.sucursal.clone(),
        }
    }
}

/// Natural key of a catalog row. Two rows sharing a code but differing in
/// description are distinct entries; renames are additive, never destructive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub codigo: String,
    pub articulo: String,
    pub sucursal: String,
}

/// One sales line from a tickets detail export, after shift and close-stamp
/// enrichment. Field names mirror the persisted columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketLine {
    pub numero: String,
    pub tipo: Option<String>,
    pub sucursal: String,
    pub mesa: Option<String>,
    pub mozo: Option<String>,
    pub nombre: Option<String>,
    pub codigo: String,
    pub descripcion: Option<String>,
    pub cantidad: Option<f64>,
    pub importe: Option<f64>,
    pub turno: Option<String>,
    pub fecha: Option<NaiveDate>,
    pub hora: Option<NaiveTime>,
}

impl TicketLine {
    pub fn key(&self) -> DetailKey {
        DetailKey {
            numero: self.numero.clone(),
            codigo: self.codigo.clone(),
        }
    }
}

/// Append-only identity of a ticket line. Ticket numbers carry a series
/// prefix, so the pair is unique without the branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetailKey {
    pub numero: String,
    pub codigo: String,
}

/// Canonical branch form: trimmed, uppercased, with runs of spaces and
/// underscores collapsed to a single underscore.
pub fn canonical_branch(raw: &str) -> String {
    raw.split(|c: char| c.is_whitespace() || c == '_')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_uppercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// Parse a quantity or amount the way the exports write them: `.` as the
/// thousands separator and `,` as the decimal comma. Plain `1234.56` is
/// accepted too. Anything else yields `None`, never an error.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains(',') {
        let normalized: String = trimmed
            .chars()
            .filter(|&c| c != '.')
            .map(|c| if c == ',' { '.' } else { c })
            .collect();
        normalized.parse().ok()
    } else {
        trimmed.parse().ok()
    }
}
