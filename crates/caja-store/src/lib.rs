//! SQLite persistence for branch sales, plus the drop-folder and operator
//! status/log primitives the ingestion pipeline runs against.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{info, warn};

use caja_core::{
    CatalogEntry, CatalogKey, Category, DetailKey, TicketLine, FECHA_CARGA_FMT, FECHA_FMT,
    HORA_FMT, MOMENTO_OPERADOR_FMT,
};

pub const CRATE_NAME: &str = "caja-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Outcome of a catalog write: rows inserted under new keys vs. rows whose
/// last-seen stamp was refreshed. The branch split counts rows that actually
/// landed, not rows attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogApplied {
    pub inserted: u64,
    pub touched: u64,
    pub by_branch: BTreeMap<String, u64>,
}

/// Outcome of a detail write: rows inserted vs. rows the key constraint
/// silently dropped. The branch split counts rows that actually landed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailApplied {
    pub inserted: u64,
    pub skipped: u64,
    pub by_branch: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub consumos: i64,
    pub detalle: i64,
}

fn consumos_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE {table} (
            Familia TEXT,
            Codigo TEXT NOT NULL,
            Articulo TEXT NOT NULL,
            Sucursal TEXT NOT NULL,
            Fecha_Carga TEXT,
            PRIMARY KEY (Codigo, Articulo, Sucursal)
        )"
    )
}

const DETALLE_DDL: &str = r#"CREATE TABLE tickets_detalle (
    "Número" TEXT NOT NULL,
    "Tipo" TEXT,
    "Sucursal" TEXT NOT NULL,
    "Mesa" TEXT,
    "Mozo" TEXT,
    "Nombre" TEXT,
    "Código" TEXT NOT NULL,
    "Descripción" TEXT,
    "Cantidad" REAL,
    "Importe" REAL,
    "Turno" TEXT,
    "Fecha" TEXT,
    "Hora" TEXT,
    PRIMARY KEY ("Número", "Código")
)"#;

#[derive(Debug)]
struct ColumnInfo {
    name: String,
    pk: i64,
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("no such table"))
}

/// Handle over the sales database. Opening creates the file and brings the
/// schema up to the current layout.
pub struct SalesStore {
    pool: SqlitePool,
}

impl SalesStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let sql = format!("PRAGMA table_info({table})");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(ColumnInfo {
                name: row.try_get("name")?,
                pk: row.try_get("pk")?,
            });
        }
        Ok(columns)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let consumos = self.table_columns("consumos").await?;
        if consumos.is_empty() {
            sqlx::query(&consumos_ddl("consumos"))
                .execute(&self.pool)
                .await?;
        } else {
            self.migrate_consumos(&consumos).await?;
        }

        let detalle = self.table_columns("tickets_detalle").await?;
        if detalle.is_empty() {
            sqlx::query(DETALLE_DDL).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn migrate_consumos(&self, columns: &[ColumnInfo]) -> Result<(), StoreError> {
        let mut keyed: Vec<&ColumnInfo> = columns.iter().filter(|c| c.pk > 0).collect();
        keyed.sort_by_key(|c| c.pk);
        let key: Vec<&str> = keyed.iter().map(|c| c.name.as_str()).collect();
        let has_stamp = columns.iter().any(|c| c.name == "Fecha_Carga");

        if key == ["Codigo", "Articulo", "Sucursal"] {
            if !has_stamp {
                sqlx::query("ALTER TABLE consumos ADD COLUMN Fecha_Carga TEXT")
                    .execute(&self.pool)
                    .await?;
                info!("consumos: added Fecha_Carga column");
            }
            return Ok(());
        }

        // Older databases keyed the catalog on (Codigo, Sucursal), which
        // collapses renamed articles. Rebuild under the wider key; the first
        // row per key wins.
        info!(old_key = ?key, "consumos: rebuilding under key (Codigo, Articulo, Sucursal)");
        let copy = if has_stamp {
            "INSERT OR IGNORE INTO consumos_nueva \
             (Familia, Codigo, Articulo, Sucursal, Fecha_Carga) \
             SELECT Familia, Codigo, Articulo, Sucursal, Fecha_Carga FROM consumos"
        } else {
            "INSERT OR IGNORE INTO consumos_nueva (Familia, Codigo, Articulo, Sucursal) \
             SELECT Familia, Codigo, Articulo, Sucursal FROM consumos"
        };
        let mut tx = self.pool.begin().await?;
        sqlx::query(&consumos_ddl("consumos_nueva"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(copy).execute(&mut *tx).await?;
        sqlx::query("DROP TABLE consumos").execute(&mut *tx).await?;
        sqlx::query("ALTER TABLE consumos_nueva RENAME TO consumos")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Every catalog key currently persisted. A missing table reads as an
    /// empty set so a fresh database starts from nothing.
    pub async fn catalog_keys(&self) -> Result<HashSet<CatalogKey>, StoreError> {
        let rows = match sqlx::query("SELECT Codigo, Articulo, Sucursal FROM consumos")
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(err) if is_missing_table(&err) => return Ok(HashSet::new()),
            Err(err) => return Err(err.into()),
        };
        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            keys.insert(CatalogKey {
                codigo: row.try_get("Codigo")?,
                articulo: row.try_get("Articulo")?,
                sucursal: row.try_get("Sucursal")?,
            });
        }
        Ok(keys)
    }

    /// Every ticket-line key currently persisted.
    pub async fn detail_keys(&self) -> Result<HashSet<DetailKey>, StoreError> {
        let rows = match sqlx::query(r#"SELECT "Número", "Código" FROM tickets_detalle"#)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(err) if is_missing_table(&err) => return Ok(HashSet::new()),
            Err(err) => return Err(err.into()),
        };
        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            keys.insert(DetailKey {
                numero: row.try_get("Número")?,
                codigo: row.try_get("Código")?,
            });
        }
        Ok(keys)
    }

    /// Apply one planned catalog reconciliation in a single transaction:
    /// insert the new entries stamped `stamp`, refresh the stamp on the keys
    /// seen again.
    pub async fn apply_catalog(
        &self,
        new_entries: &[CatalogEntry],
        touch_keys: &[CatalogKey],
        stamp: DateTime<Utc>,
    ) -> Result<CatalogApplied, StoreError> {
        let stamp = stamp.format(FECHA_CARGA_FMT).to_string();
        let mut applied = CatalogApplied::default();
        let mut tx = self.pool.begin().await?;
        for entry in new_entries {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO consumos \
                 (Familia, Codigo, Articulo, Sucursal, Fecha_Carga) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&entry.familia)
            .bind(&entry.codigo)
            .bind(&entry.articulo)
            .bind(&entry.sucursal)
            .bind(&stamp)
            .execute(&mut *tx)
            .await?;
            let landed = result.rows_affected();
            applied.inserted += landed;
            if landed > 0 {
                *applied.by_branch.entry(entry.sucursal.clone()).or_default() += landed;
            }
        }
        for key in touch_keys {
            let result = sqlx::query(
                "UPDATE consumos SET Fecha_Carga = ?1 \
                 WHERE Codigo = ?2 AND Articulo = ?3 AND Sucursal = ?4",
            )
            .bind(&stamp)
            .bind(&key.codigo)
            .bind(&key.articulo)
            .bind(&key.sucursal)
            .execute(&mut *tx)
            .await?;
            applied.touched += result.rows_affected();
        }
        tx.commit().await?;
        Ok(applied)
    }

    /// Insert ticket lines in a single transaction. The primary key absorbs
    /// replays, counted as skipped.
    pub async fn insert_detail(&self, lines: &[TicketLine]) -> Result<DetailApplied, StoreError> {
        let mut applied = DetailApplied::default();
        let mut tx = self.pool.begin().await?;
        for line in lines {
            let fecha = line.fecha.map(|d| d.format(FECHA_FMT).to_string());
            let hora = line.hora.map(|h| h.format(HORA_FMT).to_string());
            let result = sqlx::query(
                r#"INSERT OR IGNORE INTO tickets_detalle
                   ("Número", "Tipo", "Sucursal", "Mesa", "Mozo", "Nombre", "Código",
                    "Descripción", "Cantidad", "Importe", "Turno", "Fecha", "Hora")
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
            )
            .bind(&line.numero)
            .bind(&line.tipo)
            .bind(&line.sucursal)
            .bind(&line.mesa)
            .bind(&line.mozo)
            .bind(&line.nombre)
            .bind(&line.codigo)
            .bind(&line.descripcion)
            .bind(line.cantidad)
            .bind(line.importe)
            .bind(&line.turno)
            .bind(fecha)
            .bind(hora)
            .execute(&mut *tx)
            .await?;
            let landed = result.rows_affected();
            applied.inserted += landed;
            if landed > 0 {
                *applied.by_branch.entry(line.sucursal.clone()).or_default() += landed;
            }
        }
        applied.skipped = lines.len() as u64 - applied.inserted;
        tx.commit().await?;
        Ok(applied)
    }

    pub async fn table_counts(&self) -> Result<TableCounts, StoreError> {
        Ok(TableCounts {
            consumos: self.count_rows("consumos").await?,
            detalle: self.count_rows("tickets_detalle").await?,
        })
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) AS n FROM {table}");
        match sqlx::query(&sql).fetch_one(&self.pool).await {
            Ok(row) => Ok(row.try_get("n")?),
            Err(err) if is_missing_table(&err) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

fn is_spreadsheet(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xls") || ext.eq_ignore_ascii_case("xlsx"))
}

/// Drop-folder layout under the data root: one folder per export category.
#[derive(Debug, Clone)]
pub struct Inbox {
    root: PathBuf,
}

impl Inbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn folder(&self, category: Category) -> PathBuf {
        self.root.join(category.folder_name())
    }

    /// Spreadsheet files waiting in a category folder, sorted by name. A
    /// folder that does not exist yet simply has nothing pending.
    pub fn pending(&self, category: Category) -> anyhow::Result<Vec<PathBuf>> {
        let folder = self.folder(category);
        let entries = match fs::read_dir(&folder) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", folder.display()));
            }
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", folder.display()))?;
            let path = entry.path();
            if path.is_file() && is_spreadsheet(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Most recently modified pending file, if any.
    pub fn latest(&self, category: Category) -> anyhow::Result<Option<PathBuf>> {
        let mut best: Option<(SystemTime, PathBuf)> = None;
        for path in self.pending(category)? {
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .with_context(|| format!("inspecting {}", path.display()))?;
            if best.as_ref().map_or(true, |(when, _)| modified > *when) {
                best = Some((modified, path));
            }
        }
        Ok(best.map(|(_, path)| path))
    }

    /// Delete consumed source files. Failures are reported back rather than
    /// raised: the rows they fed are already committed.
    pub fn remove_consumed(&self, paths: &[PathBuf]) -> Vec<String> {
        let mut warnings = Vec::new();
        for path in paths {
            if let Err(err) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %err, "could not delete consumed file");
                warnings.push(format!("{}: {err}", path.display()));
            }
        }
        warnings
    }
}

/// How a run was started; the label is what operators see in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSource {
    Manual,
    Scheduled,
    System,
}

impl RunSource {
    pub fn label(&self) -> &'static str {
        match self {
            RunSource::Manual => "MANUAL",
            RunSource::Scheduled => "SCHEDULED",
            RunSource::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastRun {
    pub ran_at: String,
    pub status: String,
}

impl LastRun {
    pub fn succeeded(&self) -> bool {
        self.status == "SUCCESS"
    }
}

/// Two-line status file external monitors poll, overwritten after every run.
#[derive(Debug, Clone)]
pub struct RunStatusFile {
    path: PathBuf,
}

impl RunStatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn write(&self, momento: DateTime<Local>, succeeded: bool) -> anyhow::Result<()> {
        let status = if succeeded { "SUCCESS" } else { "ERROR" };
        let body = format!(
            "LAST_RUN_TIME={}\nLAST_RUN_STATUS={status}\n",
            momento.format(MOMENTO_OPERADOR_FMT)
        );
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&self.path, body).with_context(|| format!("writing {}", self.path.display()))
    }

    pub fn read(&self) -> anyhow::Result<Option<LastRun>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        let mut ran_at = String::new();
        let mut status = String::new();
        for line in text.lines() {
            if let Some(value) = line.strip_prefix("LAST_RUN_TIME=") {
                ran_at = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("LAST_RUN_STATUS=") {
                status = value.trim().to_string();
            }
        }
        Ok(Some(LastRun { ran_at, status }))
    }
}

/// Append-only operator log; one line per event with its start mode.
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    path: PathBuf,
}

impl ExecutionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(
        &self,
        momento: DateTime<Local>,
        source: RunSource,
        message: &str,
    ) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(
            file,
            "[{}] [{}] {message}",
            momento.format(MOMENTO_OPERADOR_FMT),
            source.label()
        )
        .with_context(|| format!("writing {}", self.path.display()))
    }

    pub fn read_all(&self) -> anyhow::Result<Vec<String>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        Ok(text.lines().map(str::to_string).collect())
    }

    pub fn tail(&self, lines: usize) -> anyhow::Result<Vec<String>> {
        let mut all = self.read_all()?;
        if all.len() > lines {
            all.drain(..all.len() - lines);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone};
    use std::time::Duration;

    fn entry(codigo: &str, articulo: &str, sucursal: &str) -> CatalogEntry {
        CatalogEntry {
            familia: Some("CAFETERIA".to_string()),
            codigo: codigo.to_string(),
            articulo: articulo.to_string(),
            sucursal: sucursal.to_string(),
        }
    }

    fn line(numero: &str, codigo: &str) -> TicketLine {
        TicketLine {
            numero: numero.to_string(),
            tipo: Some("FA".to_string()),
            sucursal: "PASADENA".to_string(),
            mesa: None,
            mozo: Some("MARIA".to_string()),
            nombre: None,
            codigo: codigo.to_string(),
            descripcion: Some("Cafe con leche".to_string()),
            cantidad: Some(1.0),
            importe: Some(1800.0),
            turno: Some("MAÑANA".to_string()),
            fecha: NaiveDate::from_ymd_opt(2026, 1, 18),
            hora: NaiveTime::from_hms_opt(14, 30, 0),
        }
    }

    #[tokio::test]
    async fn open_creates_an_empty_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = SalesStore::open(&dir.path().join("caja.db")).await.unwrap();
        let counts = store.table_counts().await.unwrap();
        assert_eq!(counts, TableCounts::default());
        assert!(store.catalog_keys().await.unwrap().is_empty());
        assert!(store.detail_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn catalog_inserts_then_touches() {
        let dir = tempfile::tempdir().unwrap();
        let store = SalesStore::open(&dir.path().join("caja.db")).await.unwrap();

        let stamp1 = Utc.with_ymd_and_hms(2026, 1, 18, 12, 0, 0).unwrap();
        let entries = vec![
            entry("0330", "Cafe con leche", "PASADENA"),
            entry("0330", "Cafe con leche", "CENTRO"),
        ];
        let applied = store.apply_catalog(&entries, &[], stamp1).await.unwrap();
        assert_eq!(applied.inserted, 2);
        assert_eq!(applied.touched, 0);
        assert_eq!(applied.by_branch.get("PASADENA"), Some(&1));
        assert_eq!(applied.by_branch.get("CENTRO"), Some(&1));

        let stamp2 = Utc.with_ymd_and_hms(2026, 1, 19, 12, 0, 0).unwrap();
        let applied = store
            .apply_catalog(&[], &[entries[0].key()], stamp2)
            .await
            .unwrap();
        assert_eq!(applied.inserted, 0);
        assert_eq!(applied.touched, 1);
        assert!(applied.by_branch.is_empty());

        let row = sqlx::query(
            "SELECT Fecha_Carga FROM consumos WHERE Codigo = '0330' AND Sucursal = 'PASADENA'",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        let stamp: String = row.try_get("Fecha_Carga").unwrap();
        assert_eq!(stamp, "2026-01-19 12:00:00");
    }

    #[tokio::test]
    async fn detail_replays_are_absorbed_by_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = SalesStore::open(&dir.path().join("caja.db")).await.unwrap();

        let applied = store
            .insert_detail(&[line("0001-1", "0330"), line("0001-1", "0703")])
            .await
            .unwrap();
        assert_eq!(applied.inserted, 2);
        assert_eq!(applied.skipped, 0);
        assert_eq!(applied.by_branch.get("PASADENA"), Some(&2));

        // The replayed pair is absorbed by the key, so the branch split
        // counts only the row that landed.
        let applied = store
            .insert_detail(&[line("0001-1", "0330"), line("0001-2", "0330")])
            .await
            .unwrap();
        assert_eq!(applied.inserted, 1);
        assert_eq!(applied.skipped, 1);
        assert_eq!(applied.by_branch.get("PASADENA"), Some(&1));

        let counts = store.table_counts().await.unwrap();
        assert_eq!(counts.detalle, 3);

        let row = sqlx::query(r#"SELECT "Fecha", "Hora" FROM tickets_detalle LIMIT 1"#)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let fecha: Option<String> = row.try_get("Fecha").unwrap();
        let hora: Option<String> = row.try_get("Hora").unwrap();
        assert_eq!(fecha.as_deref(), Some("2026-01-18"));
        assert_eq!(hora.as_deref(), Some("14:30:00"));
    }

    #[tokio::test]
    async fn legacy_catalog_schema_is_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caja.db");

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE consumos (
                Familia TEXT, Codigo TEXT, Articulo TEXT, Sucursal TEXT,
                PRIMARY KEY (Codigo, Sucursal)
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO consumos VALUES ('CAFETERIA', '0330', 'Cafe', 'PASADENA')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO consumos VALUES ('PIZZAS', '0101', 'Muzzarella', 'PASADENA')")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let store = SalesStore::open(&path).await.unwrap();
        let columns = store.table_columns("consumos").await.unwrap();
        assert!(columns.iter().any(|c| c.name == "Fecha_Carga"));
        let mut key: Vec<&ColumnInfo> = columns.iter().filter(|c| c.pk > 0).collect();
        key.sort_by_key(|c| c.pk);
        let key: Vec<&str> = key.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(key, ["Codigo", "Articulo", "Sucursal"]);

        let counts = store.table_counts().await.unwrap();
        assert_eq!(counts.consumos, 2);
        let keys = store.catalog_keys().await.unwrap();
        assert!(keys.contains(&CatalogKey {
            codigo: "0330".to_string(),
            articulo: "Cafe".to_string(),
            sucursal: "PASADENA".to_string(),
        }));

        // A second open finds the current layout and leaves it alone.
        drop(store);
        let store = SalesStore::open(&path).await.unwrap();
        assert_eq!(store.table_counts().await.unwrap().consumos, 2);
    }

    #[tokio::test]
    async fn key_reads_tolerate_dropped_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = SalesStore::open(&dir.path().join("caja.db")).await.unwrap();
        sqlx::query("DROP TABLE consumos")
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(store.catalog_keys().await.unwrap().is_empty());
        assert_eq!(store.table_counts().await.unwrap().consumos, 0);
    }

    #[test]
    fn inbox_lists_only_spreadsheets() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::new(dir.path());
        let folder = inbox.folder(Category::Consumos);
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("b.xlsx"), b"x").unwrap();
        fs::write(folder.join("a.XLS"), b"x").unwrap();
        fs::write(folder.join("notas.txt"), b"x").unwrap();
        fs::write(folder.join("resumen.pdf"), b"x").unwrap();

        let pending = inbox.pending(Category::Consumos).unwrap();
        let names: Vec<_> = pending
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["a.XLS", "b.xlsx"]);

        assert!(inbox.pending(Category::Detalle).unwrap().is_empty());
    }

    #[test]
    fn inbox_latest_prefers_the_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::new(dir.path());
        let folder = inbox.folder(Category::Cinta);
        fs::create_dir_all(&folder).unwrap();
        let old = folder.join("vieja.xlsx");
        let new = folder.join("nueva.xlsx");
        fs::write(&old, b"x").unwrap();
        fs::write(&new, b"x").unwrap();
        let past = SystemTime::now() - Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let latest = inbox.latest(Category::Cinta).unwrap();
        assert_eq!(latest, Some(new));
    }

    #[test]
    fn remove_consumed_reports_but_does_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::new(dir.path());
        let folder = inbox.folder(Category::Consumos);
        fs::create_dir_all(&folder).unwrap();
        let real = folder.join("consumos_PASADENA_18_01_2026.xlsx");
        fs::write(&real, b"x").unwrap();
        let ghost = folder.join("desaparecida.xlsx");

        let warnings = inbox.remove_consumed(&[real.clone(), ghost.clone()]);
        assert!(!real.exists());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("desaparecida.xlsx"));
    }

    #[test]
    fn status_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let status = RunStatusFile::new(dir.path().join("last_run.txt"));
        assert!(status.read().unwrap().is_none());

        let momento = Local.with_ymd_and_hms(2026, 1, 18, 8, 0, 0).unwrap();
        status.write(momento, true).unwrap();
        let last = status.read().unwrap().unwrap();
        assert_eq!(last.ran_at, "18/01/2026 08:00:00");
        assert!(last.succeeded());

        status.write(momento, false).unwrap();
        assert!(!status.read().unwrap().unwrap().succeeded());
    }

    #[test]
    fn execution_log_appends_and_tails() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExecutionLog::new(dir.path().join("execution_log.txt"));
        let momento = Local.with_ymd_and_hms(2026, 1, 18, 8, 0, 0).unwrap();
        log.append(momento, RunSource::Manual, "corrida iniciada").unwrap();
        log.append(momento, RunSource::Scheduled, "corrida completada").unwrap();

        let all = log.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], "[18/01/2026 08:00:00] [MANUAL] corrida iniciada");

        let tail = log.tail(1).unwrap();
        assert_eq!(tail, ["[18/01/2026 08:00:00] [SCHEDULED] corrida completada"]);
    }
}
