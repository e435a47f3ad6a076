//! Axum + Askama consultation UI over the sales database.

use std::collections::BTreeMap;
use std::path::PathBuf;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use caja_ingest::IngestConfig;
use caja_store::RunStatusFile;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::sync::Arc;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "caja-web";

#[derive(Clone)]
pub struct AppState {
    pub db_path: PathBuf,
    pub status_path: PathBuf,
}

impl AppState {
    pub fn new(db_path: impl Into<PathBuf>, status_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            status_path: status_path.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SucursalRow {
    pub sucursal: String,
    pub productos: i64,
    pub tickets: i64,
}

#[derive(Debug, Clone, Serialize)]
struct EstadoView {
    ultima_corrida: String,
    ultimo_estado: String,
    exito: bool,
    total_consumos: i64,
    total_detalle: i64,
    sucursales: Vec<SucursalRow>,
}

#[derive(Debug, Deserialize, Default)]
struct RangoQuery {
    sucursal: Option<String>,
    desde: Option<String>,
    hasta: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct FacturacionRow {
    fecha: String,
    turno: String,
    total: f64,
}

#[derive(Debug, Deserialize, Default)]
struct RankingQuery {
    sucursal: Option<String>,
    por: Option<String>,
    limite: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct RankingRow {
    descripcion: String,
    cantidad: f64,
    importe: f64,
}

#[derive(Debug, Deserialize, Default)]
struct CombosQuery {
    producto: Option<String>,
    sucursal: Option<String>,
    limite: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct ComboRow {
    descripcion: String,
    veces: i64,
}

#[derive(Template)]
#[template(path = "estado.html")]
struct EstadoTemplate {
    ultima_corrida: String,
    ultimo_estado: String,
    exito: bool,
    total_consumos: i64,
    total_detalle: i64,
    sucursales: Vec<SucursalRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/estado", get(estado_handler))
        .route("/api/sucursales", get(sucursales_handler))
        .route("/api/facturacion", get(facturacion_handler))
        .route("/api/ranking", get(ranking_handler))
        .route("/api/combos", get(combos_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CAJA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = IngestConfig::from_env();
    let state = AppState::new(config.db_path, config.status_path);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_estado(&state).await {
        Ok(view) => render_html(EstadoTemplate {
            ultima_corrida: view.ultima_corrida,
            ultimo_estado: view.ultimo_estado,
            exito: view.exito,
            total_consumos: view.total_consumos,
            total_detalle: view.total_detalle,
            sucursales: view.sucursales,
        }),
        Err(err) => server_error(err),
    }
}

async fn estado_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_estado(&state).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => server_error(err),
    }
}

async fn sucursales_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pool) = connect_db(&state).await else {
        return Json(Vec::<SucursalRow>::new()).into_response();
    };
    match load_sucursales(&pool).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn facturacion_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangoQuery>,
) -> Response {
    let Some(pool) = connect_db(&state).await else {
        return Json(Vec::<FacturacionRow>::new()).into_response();
    };
    match load_facturacion(&pool, &query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn ranking_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RankingQuery>,
) -> Response {
    let Some(pool) = connect_db(&state).await else {
        return Json(Vec::<RankingRow>::new()).into_response();
    };
    match load_ranking(&pool, &query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn combos_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CombosQuery>,
) -> Response {
    let producto = query
        .producto
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());
    let Some(producto) = producto else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "falta el parámetro producto"})),
        )
            .into_response();
    };
    let Some(pool) = connect_db(&state).await else {
        return Json(Vec::<ComboRow>::new()).into_response();
    };
    match load_combos(&pool, producto, &query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

/// A fresh read-only pool per request; `None` when the database does not
/// exist yet, which the handlers render as an empty dashboard.
async fn connect_db(state: &AppState) -> Option<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(&state.db_path)
        .read_only(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .ok()
}

async fn load_estado(state: &AppState) -> anyhow::Result<EstadoView> {
    let last = RunStatusFile::new(&state.status_path).read()?;
    let (ultima_corrida, ultimo_estado, exito) = match last {
        Some(last) => {
            let exito = last.succeeded();
            (last.ran_at, last.status, exito)
        }
        None => ("sin corridas registradas".to_string(), "-".to_string(), false),
    };

    let (total_consumos, total_detalle, sucursales) = match connect_db(state).await {
        Some(pool) => {
            let consumos = count_rows(&pool, "consumos").await?;
            let detalle = count_rows(&pool, "tickets_detalle").await?;
            let sucursales = load_sucursales(&pool).await?;
            (consumos, detalle, sucursales)
        }
        None => (0, 0, Vec::new()),
    };

    Ok(EstadoView {
        ultima_corrida,
        ultimo_estado,
        exito,
        total_consumos,
        total_detalle,
        sucursales,
    })
}

async fn count_rows(pool: &SqlitePool, table: &str) -> anyhow::Result<i64> {
    let sql = format!("SELECT COUNT(*) AS n FROM {table}");
    match sqlx::query(&sql).fetch_one(pool).await {
        Ok(row) => Ok(row.try_get("n")?),
        Err(sqlx::Error::Database(db)) if db.message().contains("no such table") => Ok(0),
        Err(err) => Err(err.into()),
    }
}

async fn load_sucursales(pool: &SqlitePool) -> anyhow::Result<Vec<SucursalRow>> {
    let mut by_branch: BTreeMap<String, SucursalRow> = BTreeMap::new();

    let rows = sqlx::query("SELECT Sucursal, COUNT(*) AS n FROM consumos GROUP BY Sucursal")
        .fetch_all(pool)
        .await
        .unwrap_or_default();
    for row in rows {
        let sucursal: String = row.try_get("Sucursal")?;
        let n: i64 = row.try_get("n")?;
        by_branch
            .entry(sucursal.clone())
            .or_insert_with(|| SucursalRow {
                sucursal,
                productos: 0,
                tickets: 0,
            })
            .productos = n;
    }

    let rows = sqlx::query(
        r#"SELECT "Sucursal" AS sucursal, COUNT(DISTINCT "Número") AS n
           FROM tickets_detalle GROUP BY "Sucursal""#,
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    for row in rows {
        let sucursal: String = row.try_get("sucursal")?;
        let n: i64 = row.try_get("n")?;
        by_branch
            .entry(sucursal.clone())
            .or_insert_with(|| SucursalRow {
                sucursal,
                productos: 0,
                tickets: 0,
            })
            .tickets = n;
    }

    Ok(by_branch.into_values().collect())
}

async fn load_facturacion(
    pool: &SqlitePool,
    query: &RangoQuery,
) -> anyhow::Result<Vec<FacturacionRow>> {
    let sucursal = query.sucursal.clone().unwrap_or_default();
    let desde = query.desde.clone().unwrap_or_default();
    let hasta = query.hasta.clone().unwrap_or_default();
    let rows = sqlx::query(
        r#"
        SELECT "Fecha" AS fecha,
               COALESCE("Turno", '') AS turno,
               SUM("Cantidad" * "Importe") AS total
          FROM tickets_detalle
         WHERE "Fecha" IS NOT NULL
           AND (?1 = '' OR "Sucursal" = ?1)
           AND (?2 = '' OR "Fecha" >= ?2)
           AND (?3 = '' OR "Fecha" <= ?3)
         GROUP BY "Fecha", "Turno"
         ORDER BY "Fecha", "Turno"
        "#,
    )
    .bind(&sucursal)
    .bind(&desde)
    .bind(&hasta)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(FacturacionRow {
            fecha: row.try_get("fecha")?,
            turno: row.try_get("turno")?,
            total: row.try_get::<Option<f64>, _>("total")?.unwrap_or(0.0),
        });
    }
    Ok(out)
}

async fn load_ranking(pool: &SqlitePool, query: &RankingQuery) -> anyhow::Result<Vec<RankingRow>> {
    let sucursal = query.sucursal.clone().unwrap_or_default();
    let limite = query.limite.unwrap_or(15).clamp(1, 100);
    // Two fixed statements rather than interpolating the sort key.
    let por_importe = matches!(query.por.as_deref(), Some("importe"));
    let sql = if por_importe {
        r#"
        SELECT COALESCE("Descripción", '(sin descripción)') AS descripcion,
               SUM("Cantidad") AS cantidad,
               SUM("Cantidad" * "Importe") AS importe
          FROM tickets_detalle
         WHERE (?1 = '' OR "Sucursal" = ?1)
         GROUP BY "Descripción"
         ORDER BY importe DESC
         LIMIT ?2
        "#
    } else {
        r#"
        SELECT COALESCE("Descripción", '(sin descripción)') AS descripcion,
               SUM("Cantidad") AS cantidad,
               SUM("Cantidad" * "Importe") AS importe
          FROM tickets_detalle
         WHERE (?1 = '' OR "Sucursal" = ?1)
         GROUP BY "Descripción"
         ORDER BY cantidad DESC
         LIMIT ?2
        "#
    };
    let rows = sqlx::query(sql)
        .bind(&sucursal)
        .bind(limite)
        .fetch_all(pool)
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(RankingRow {
            descripcion: row.try_get("descripcion")?,
            cantidad: row.try_get::<Option<f64>, _>("cantidad")?.unwrap_or(0.0),
            importe: row.try_get::<Option<f64>, _>("importe")?.unwrap_or(0.0),
        });
    }
    Ok(out)
}

async fn load_combos(
    pool: &SqlitePool,
    producto: &str,
    query: &CombosQuery,
) -> anyhow::Result<Vec<ComboRow>> {
    let sucursal = query.sucursal.clone().unwrap_or_default();
    let limite = query.limite.unwrap_or(15).clamp(1, 100);
    let rows = sqlx::query(
        r#"
        SELECT t2."Descripción" AS descripcion, COUNT(*) AS veces
          FROM tickets_detalle t1
          JOIN tickets_detalle t2
            ON t2."Número" = t1."Número"
           AND t2."Sucursal" = t1."Sucursal"
         WHERE t1."Descripción" = ?1
           AND t2."Descripción" IS NOT NULL
           AND t2."Descripción" <> t1."Descripción"
           AND (?2 = '' OR t1."Sucursal" = ?2)
         GROUP BY t2."Descripción"
         ORDER BY veces DESC
         LIMIT ?3
        "#,
    )
    .bind(producto)
    .bind(&sucursal)
    .bind(limite)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ComboRow {
            descripcion: row.try_get("descripcion")?,
            veces: row.try_get("veces")?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use caja_core::{CatalogEntry, TicketLine};
    use caja_store::SalesStore;
    use chrono::{Local, NaiveDate, NaiveTime, Utc};
    use http_body_util::BodyExt;
    use std::path::Path;
    use tower::ServiceExt;

    fn entry(codigo: &str, articulo: &str, sucursal: &str) -> CatalogEntry {
        CatalogEntry {
            familia: Some("PIZZAS".to_string()),
            codigo: codigo.to_string(),
            articulo: articulo.to_string(),
            sucursal: sucursal.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn line(
        numero: &str,
        sucursal: &str,
        codigo: &str,
        descripcion: &str,
        cantidad: f64,
        importe: f64,
        turno: &str,
        fecha: &str,
    ) -> TicketLine {
        TicketLine {
            numero: numero.to_string(),
            tipo: Some("TI".to_string()),
            sucursal: sucursal.to_string(),
            mesa: None,
            mozo: None,
            nombre: None,
            codigo: codigo.to_string(),
            descripcion: Some(descripcion.to_string()),
            cantidad: Some(cantidad),
            importe: Some(importe),
            turno: Some(turno.to_string()),
            fecha: NaiveDate::parse_from_str(fecha, "%Y-%m-%d").ok(),
            hora: NaiveTime::from_hms_opt(21, 15, 0),
        }
    }

    async fn seed_state(root: &Path) -> AppState {
        let db_path = root.join("caja.db");
        let status_path = root.join("last_run.txt");

        let store = SalesStore::open(&db_path).await.unwrap();
        store
            .apply_catalog(
                &[
                    entry("0101", "Muzzarella grande", "PASADENA"),
                    entry("2040", "Gaseosa 1.5L", "PASADENA"),
                    entry("0512", "Faina", "CENTRO"),
                ],
                &[],
                Utc::now(),
            )
            .await
            .unwrap();
        store
            .insert_detail(&[
                line("0001-1", "PASADENA", "0101", "Muzzarella grande", 2.0, 11_000.0, "NOCHE", "2026-01-18"),
                line("0001-1", "PASADENA", "2040", "Gaseosa 1.5L", 1.0, 3_000.0, "NOCHE", "2026-01-18"),
                line("0001-2", "PASADENA", "0101", "Muzzarella grande", 1.0, 11_000.0, "MEDIODIA", "2026-01-19"),
                line("0002-1", "CENTRO", "0512", "Faina", 5.0, 500.0, "NOCHE", "2026-01-18"),
            ])
            .await
            .unwrap();

        RunStatusFile::new(&status_path)
            .write(Local::now(), true)
            .unwrap();
        AppState::new(db_path, status_path)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn index_page_shows_status_and_branches() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(seed_state(dir.path()).await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("CAJA"));
        assert!(text.contains("PASADENA"));
        assert!(text.contains("CENTRO"));
    }

    #[tokio::test]
    async fn estado_json_reports_totals() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(seed_state(dir.path()).await);
        let (status, v) = get_json(app, "/api/estado").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["exito"], serde_json::json!(true));
        assert_eq!(v["total_consumos"], serde_json::json!(3));
        assert_eq!(v["total_detalle"], serde_json::json!(4));
    }

    #[tokio::test]
    async fn facturacion_sums_by_day_and_shift() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(seed_state(dir.path()).await);
        let (status, v) = get_json(
            app,
            "/api/facturacion?sucursal=PASADENA&desde=2026-01-18&hasta=2026-01-18",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rows = v.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["fecha"], serde_json::json!("2026-01-18"));
        assert_eq!(rows[0]["turno"], serde_json::json!("NOCHE"));
        assert_eq!(rows[0]["total"].as_f64(), Some(25_000.0));
    }

    #[tokio::test]
    async fn ranking_orders_by_quantity_or_revenue() {
        let dir = tempfile::tempdir().unwrap();
        let state = seed_state(dir.path()).await;

        let (_, by_cantidad) = get_json(app(state.clone()), "/api/ranking?por=cantidad").await;
        assert_eq!(
            by_cantidad[0]["descripcion"],
            serde_json::json!("Faina")
        );

        let (_, by_importe) = get_json(app(state), "/api/ranking?por=importe").await;
        assert_eq!(
            by_importe[0]["descripcion"],
            serde_json::json!("Muzzarella grande")
        );
    }

    #[tokio::test]
    async fn combos_require_a_product_and_count_companions() {
        let dir = tempfile::tempdir().unwrap();
        let state = seed_state(dir.path()).await;

        let (status, v) = get_json(app(state.clone()), "/api/combos").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(v["error"].is_string());

        let (status, v) =
            get_json(app(state), "/api/combos?producto=Muzzarella%20grande").await;
        assert_eq!(status, StatusCode::OK);
        let rows = v.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["descripcion"], serde_json::json!("Gaseosa 1.5L"));
        assert_eq!(rows[0]["veces"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn missing_database_renders_an_empty_dashboard() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path().join("inexistente.db"), dir.path().join("last_run.txt"));

        let resp = app(state.clone())
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("sin corridas registradas"));

        let (status, v) = get_json(app(state), "/api/sucursales").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v, serde_json::json!([]));
    }
}
