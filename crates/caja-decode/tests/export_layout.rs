//! Drives the decode pipeline the way ingestion does: grid in, shaped rows
//! and a file-name identity out.

use caja_decode::{
    audit_rows, catalog_rows, detail_rows, Cell, DecodeError, SheetTable, SourceTag,
};
use chrono::NaiveDate;

fn t(s: &str) -> Cell {
    Cell::Text(s.to_string())
}

fn banner() -> Vec<Vec<Cell>> {
    vec![
        vec![t("PIZZERIA LA CENTRAL")],
        vec![t("Listado emitido por el portal")],
        vec![t("Desde: 01/01/2026"), t("Hasta: 18/01/2026")],
    ]
}

#[test]
fn consumos_export_shapes_into_catalog_rows() {
    let mut grid = banner();
    grid.push(vec![t("Familia"), t("Código"), t("Artículo"), t("Cant."), t("Total")]);
    grid.push(vec![
        t("PIZZAS"),
        t("0101"),
        t("Muzzarella grande"),
        Cell::Number(14.0),
        Cell::Number(154_000.0),
    ]);
    grid.push(vec![
        t("BEBIDAS"),
        Cell::Number(2040.0),
        t("Gaseosa 1.5L"),
        Cell::Number(9.0),
        Cell::Number(27_000.0),
    ]);
    grid.push(vec![t("TOTAL GENERAL")]);

    let table = SheetTable::from_grid(grid).unwrap();
    let rows = catalog_rows(&table);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].codigo, "0101");
    assert_eq!(rows[1].codigo, "2040");

    let tag = SourceTag::from_stem("consumos_LA_CENTRAL_18_01_2026").unwrap();
    assert_eq!(tag.sucursal, "LA_CENTRAL");
    assert_eq!(tag.captured_on, NaiveDate::from_ymd_opt(2026, 1, 18).unwrap());
}

#[test]
fn detalle_and_cinta_exports_shape_into_joinable_rows() {
    let mut detalle = banner();
    detalle.push(vec![
        t("Número"),
        t("Tipo"),
        t("F.Cierre"),
        t("Mesa"),
        t("Mozo"),
        t("Nombre"),
        t("Código"),
        t("Descripción"),
        t("Cantidad"),
        t("Importe"),
    ]);
    detalle.push(vec![
        t("0003-00012001"),
        t("TI"),
        t("18/01/2026 21:15:40"),
        t("7"),
        t("JULIO"),
        t("Consumidor Final"),
        t("0101"),
        t("Muzzarella grande"),
        t("1,00"),
        t("11.000,00"),
    ]);

    let mut cinta = banner();
    cinta.push(vec![t("Número"), t("TURNO")]);
    cinta.push(vec![t("0003-00012001"), t("NOCHE")]);

    let detalle = detail_rows(&SheetTable::from_grid(detalle).unwrap()).unwrap();
    let cinta = audit_rows(&SheetTable::from_grid(cinta).unwrap()).unwrap();

    assert_eq!(detalle.len(), 1);
    assert_eq!(detalle[0].importe, Some(11_000.0));
    assert_eq!(cinta.len(), 1);
    assert_eq!(detalle[0].numero, cinta[0].numero);
}

#[test]
fn unreadable_files_surface_a_workbook_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("consumos_LA_CENTRAL_18_01_2026.xlsx");
    std::fs::write(&path, b"esto no es un workbook").unwrap();

    match caja_decode::read_grid(&path) {
        Err(DecodeError::Workbook { path: reported, .. }) => {
            assert!(reported.ends_with("consumos_LA_CENTRAL_18_01_2026.xlsx"));
        }
        other => panic!("expected a workbook error, got {other:?}"),
    }
}
