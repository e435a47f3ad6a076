//! Ingestion orchestration: scan the drop folders, reconcile against the
//! store, persist, and leave a report plus the operator status/log trail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use caja_core::{CatalogEntry, CatalogKey, Category, DetailKey, TicketLine};
use caja_decode::{
    audit_rows, catalog_rows, detail_rows, read_grid, AuditRow, Cell, DetailRow, SheetTable,
    SourceTag,
};
use caja_store::{
    ExecutionLog, Inbox, RunSource, RunStatusFile, SalesStore, TableCounts,
};

pub const CRATE_NAME: &str = "caja-ingest";

/// Runtime configuration, environment-driven like the rest of the tooling.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub data_root: PathBuf,
    pub db_path: PathBuf,
    pub status_path: PathBuf,
    pub log_path: PathBuf,
    pub reports_root: PathBuf,
    pub schedule_times: Vec<NaiveTime>,
}

impl IngestConfig {
    /// Read configuration from the environment. Defaults mirror the desktop
    /// deployment: everything under a `DataBase` folder next to the binary.
    pub fn from_env() -> Self {
        let data_root = PathBuf::from(
            std::env::var("CAJA_DATA_ROOT").unwrap_or_else(|_| "DataBase".to_string()),
        );
        let db_path = std::env::var("CAJA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("caja.db"));
        let status_path = std::env::var("CAJA_STATUS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("last_run.txt"));
        let log_path = std::env::var("CAJA_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("execution_log.txt"));
        let reports_root = PathBuf::from(
            std::env::var("CAJA_REPORTS_DIR").unwrap_or_else(|_| "reports".to_string()),
        );
        Self {
            data_root,
            db_path,
            status_path,
            log_path,
            reports_root,
            schedule_times: schedule_times_from_env(),
        }
    }
}

fn schedule_times_from_env() -> Vec<NaiveTime> {
    let mut times = Vec::new();
    for (var, fallback) in [
        ("SCHEDULE_TIME_1", "08:00"),
        ("SCHEDULE_TIME_2", "14:00"),
        ("SCHEDULE_TIME_3", "20:00"),
    ] {
        let raw = std::env::var(var).unwrap_or_else(|_| fallback.to_string());
        match parse_schedule_time(&raw) {
            Some(time) => times.push(time),
            None => warn!(%var, value = %raw, "ignoring unparseable schedule time"),
        }
    }
    times
}

fn parse_schedule_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

/// Ticket number to shift label, built from the newest cinta-testigo export.
/// Later rows win when the log repeats a ticket.
#[derive(Debug, Default)]
pub struct ShiftIndex {
    by_ticket: HashMap<String, String>,
}

impl ShiftIndex {
    pub fn from_audit(rows: &[AuditRow]) -> Self {
        let mut by_ticket = HashMap::new();
        for row in rows {
            if let Some(turno) = row.turno.as_deref() {
                let turno = turno.trim();
                if !turno.is_empty() {
                    by_ticket.insert(row.numero.clone(), turno.to_string());
                }
            }
        }
        Self { by_ticket }
    }

    pub fn shift_for(&self, numero: &str) -> Option<&str> {
        self.by_ticket.get(numero).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_ticket.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ticket.is_empty()
    }
}

fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    // Day count against the 1899-12-30 workbook epoch.
    if !(1.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let seconds = (serial * 86_400.0).round() as i64;
    epoch.checked_add_signed(Duration::seconds(seconds))
}

/// Split a raw close stamp into its date and time halves. `None` when the
/// cell cannot be read as a moment.
pub fn split_close(cell: &Cell) -> Option<(NaiveDate, NaiveTime)> {
    match cell {
        Cell::Timestamp(ts) => Some((ts.date(), ts.time())),
        Cell::Number(serial) => {
            excel_serial_to_datetime(*serial).map(|ts| (ts.date(), ts.time()))
        }
        Cell::Text(text) => {
            let text = text.trim();
            for fmt in [
                "%d/%m/%Y %H:%M:%S",
                "%d/%m/%Y %H:%M",
                "%Y-%m-%d %H:%M:%S",
                "%Y-%m-%dT%H:%M:%S",
            ] {
                if let Ok(ts) = NaiveDateTime::parse_from_str(text, fmt) {
                    return Some((ts.date(), ts.time()));
                }
            }
            for fmt in ["%d/%m/%Y", "%Y-%m-%d"] {
                if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
                    return Some((date, NaiveTime::MIN));
                }
            }
            None
        }
        Cell::Empty => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichStats {
    pub missing_shift: usize,
    pub invalid_close: usize,
}

/// Attach shift labels and split close stamps onto decoded detail rows,
/// producing persistable ticket lines. Rows keep flowing when a lookup
/// misses; the stats say how often that happened.
pub fn enrich_details(
    rows: Vec<(DetailRow, String)>,
    shifts: &ShiftIndex,
) -> (Vec<TicketLine>, EnrichStats) {
    let mut stats = EnrichStats::default();
    let mut lines = Vec::with_capacity(rows.len());
    for (row, sucursal) in rows {
        let turno = match shifts.shift_for(&row.numero) {
            Some(turno) => Some(turno.to_string()),
            None => {
                stats.missing_shift += 1;
                None
            }
        };
        let (fecha, hora) = match &row.cierre {
            Some(cell) => match split_close(cell) {
                Some((fecha, hora)) => (Some(fecha), Some(hora)),
                None => {
                    stats.invalid_close += 1;
                    (None, None)
                }
            },
            None => (None, None),
        };
        lines.push(TicketLine {
            numero: row.numero,
            tipo: row.tipo,
            sucursal,
            mesa: row.mesa,
            mozo: row.mozo,
            nombre: row.nombre,
            codigo: row.codigo,
            descripcion: row.descripcion,
            cantidad: row.cantidad,
            importe: row.importe,
            turno,
            fecha,
            hora,
        });
    }
    (lines, stats)
}

#[derive(Debug, Default)]
pub struct CatalogPlan {
    pub new_entries: Vec<CatalogEntry>,
    pub touch_keys: Vec<CatalogKey>,
    pub batch_repeats: usize,
}

/// Diff decoded catalog entries against the persisted key set. The first
/// occurrence of a key in the batch decides whether it is inserted or
/// touched; repeats within the batch are only counted.
pub fn plan_catalog(entries: Vec<CatalogEntry>, existing: &HashSet<CatalogKey>) -> CatalogPlan {
    let mut plan = CatalogPlan::default();
    let mut seen: HashSet<CatalogKey> = HashSet::new();
    for entry in entries {
        let key = entry.key();
        if !seen.insert(key.clone()) {
            plan.batch_repeats += 1;
            continue;
        }
        if existing.contains(&key) {
            plan.touch_keys.push(key);
        } else {
            plan.new_entries.push(entry);
        }
    }
    plan
}

#[derive(Debug, Default)]
pub struct DetailPlan {
    pub new_lines: Vec<TicketLine>,
    pub duplicates: usize,
}

/// Keep only ticket lines whose key is neither persisted nor seen earlier in
/// the batch.
pub fn plan_detail(lines: Vec<TicketLine>, existing: &HashSet<DetailKey>) -> DetailPlan {
    let mut plan = DetailPlan::default();
    let mut seen: HashSet<DetailKey> = HashSet::new();
    for line in lines {
        let key = line.key();
        if existing.contains(&key) || !seen.insert(key) {
            plan.duplicates += 1;
            continue;
        }
        plan.new_lines.push(line);
    }
    plan
}

/// Per-category outcome, embedded in the run report artifact.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryOutcome {
    pub files_seen: usize,
    pub files_read: usize,
    pub files_skipped: usize,
    pub rows_read: usize,
    pub inserted: u64,
    pub touched: u64,
    pub duplicates: usize,
    pub missing_shift: usize,
    pub invalid_close: usize,
    /// Rows that actually landed, split by branch.
    pub by_branch: BTreeMap<String, u64>,
    pub cleanup_warnings: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub consumos: CategoryOutcome,
    pub detalle: CategoryOutcome,
    pub total_consumos: i64,
    pub total_detalle: i64,
    pub report_path: String,
}

impl RunReport {
    pub fn exito(&self) -> bool {
        self.consumos.error.is_none() && self.detalle.error.is_none()
    }

    pub fn status_token(&self) -> &'static str {
        if self.exito() {
            "SUCCESS"
        } else {
            "ERROR"
        }
    }

    /// One-line summary for the operator log.
    pub fn log_line(&self) -> String {
        let consumos = match &self.consumos.error {
            None => format!(
                "consumos +{} nuevos, {} marcados",
                self.consumos.inserted, self.consumos.touched
            ),
            Some(err) => format!("consumos ERROR: {err}"),
        };
        let detalle = match &self.detalle.error {
            None => format!(
                "detalle +{} nuevas, {} duplicadas",
                self.detalle.inserted, self.detalle.duplicates
            ),
            Some(err) => format!("detalle ERROR: {err}"),
        };
        format!("corrida {}: {consumos}; {detalle}", self.run_id)
    }
}

fn read_catalog_file(path: &Path) -> Result<Vec<CatalogEntry>> {
    let tag = SourceTag::from_path(path)?;
    let grid = read_grid(path)?;
    let table = SheetTable::from_grid(grid)?;
    Ok(catalog_rows(&table)
        .into_iter()
        .map(|row| CatalogEntry {
            familia: row.familia,
            codigo: row.codigo,
            articulo: row.articulo,
            sucursal: tag.sucursal.clone(),
        })
        .collect())
}

fn read_detail_file(path: &Path) -> Result<(SourceTag, Vec<DetailRow>)> {
    let tag = SourceTag::from_path(path)?;
    let grid = read_grid(path)?;
    let table = SheetTable::from_grid(grid)?;
    let rows = detail_rows(&table)?;
    Ok((tag, rows))
}

fn read_audit_file(path: &Path) -> Result<Vec<AuditRow>> {
    let grid = read_grid(path)?;
    let table = SheetTable::from_grid(grid)?;
    Ok(audit_rows(&table)?)
}

/// Build the shift index from the newest cinta-testigo file. Any problem
/// degrades to an empty index: detail rows then persist without a shift and
/// the cinta files stay put for the next run.
fn load_shift_index(inbox: &Inbox) -> (ShiftIndex, Vec<PathBuf>) {
    let pending = match inbox.pending(Category::Cinta) {
        Ok(pending) => pending,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "could not list cinta folder");
            return (ShiftIndex::default(), Vec::new());
        }
    };
    if pending.is_empty() {
        info!("no cinta file pending, shifts will be empty");
        return (ShiftIndex::default(), Vec::new());
    }
    let newest = match inbox.latest(Category::Cinta) {
        Ok(Some(path)) => path,
        Ok(None) => return (ShiftIndex::default(), Vec::new()),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "could not pick newest cinta file");
            return (ShiftIndex::default(), Vec::new());
        }
    };
    match read_audit_file(&newest) {
        Ok(rows) => {
            let index = ShiftIndex::from_audit(&rows);
            info!(path = %newest.display(), tickets = index.len(), "shift index loaded");
            (index, pending)
        }
        Err(err) => {
            warn!(
                path = %newest.display(),
                error = %format!("{err:#}"),
                "cinta file unreadable, shifts will be empty"
            );
            (ShiftIndex::default(), Vec::new())
        }
    }
}

async fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(report).context("encoding run report")?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// One full ingestion pass over the drop folders.
pub struct IngestPipeline {
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Self {
        Self { config }
    }

    /// Run both categories once. Only failing to open the database aborts the
    /// run; each category otherwise fails on its own and the other proceeds.
    pub async fn run_once(&self, source: RunSource) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, source = source.label(), "ingestion run started");

        let store = SalesStore::open(&self.config.db_path)
            .await
            .with_context(|| format!("opening database {}", self.config.db_path.display()))?;
        let inbox = Inbox::new(&self.config.data_root);

        let consumos = match self.ingest_consumos(&store, &inbox).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "consumos ingestion failed");
                CategoryOutcome {
                    error: Some(message),
                    ..Default::default()
                }
            }
        };
        let detalle = match self.ingest_detalle(&store, &inbox).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "detalle ingestion failed");
                CategoryOutcome {
                    error: Some(message),
                    ..Default::default()
                }
            }
        };

        let totals = match store.table_counts().await {
            Ok(totals) => totals,
            Err(err) => {
                warn!(error = %err, "could not read table totals");
                TableCounts::default()
            }
        };

        let report_path = self
            .config
            .reports_root
            .join(run_id.to_string())
            .join("resumen.json");
        let mut report = RunReport {
            run_id,
            source: source.label().to_string(),
            started_at,
            finished_at: Utc::now(),
            consumos,
            detalle,
            total_consumos: totals.consumos,
            total_detalle: totals.detalle,
            report_path: report_path.display().to_string(),
        };
        if let Err(err) = write_report(&report_path, &report).await {
            warn!(error = %format!("{err:#}"), "could not write run report");
            report.report_path = String::new();
        }

        let momento = Local::now();
        let log = ExecutionLog::new(&self.config.log_path);
        if let Err(err) = log.append(momento, source, &report.log_line()) {
            warn!(error = %format!("{err:#}"), "could not append to execution log");
        }
        let status = RunStatusFile::new(&self.config.status_path);
        if let Err(err) = status.write(momento, report.exito()) {
            warn!(error = %format!("{err:#}"), "could not write status file");
        }

        info!(
            %run_id,
            status = report.status_token(),
            consumos = report.consumos.inserted,
            detalle = report.detalle.inserted,
            "ingestion run finished"
        );
        Ok(report)
    }

    async fn ingest_consumos(&self, store: &SalesStore, inbox: &Inbox) -> Result<CategoryOutcome> {
        let mut outcome = CategoryOutcome::default();
        let pending = inbox.pending(Category::Consumos)?;
        outcome.files_seen = pending.len();
        if pending.is_empty() {
            info!("no consumos files pending");
            return Ok(outcome);
        }

        let existing = store.catalog_keys().await?;
        let mut entries: Vec<CatalogEntry> = Vec::new();
        let mut consumed: Vec<PathBuf> = Vec::new();
        for path in pending {
            match read_catalog_file(&path) {
                Ok(file_entries) => {
                    outcome.files_read += 1;
                    outcome.rows_read += file_entries.len();
                    entries.extend(file_entries);
                    consumed.push(path);
                }
                Err(err) => {
                    outcome.files_skipped += 1;
                    warn!(
                        path = %path.display(),
                        error = %format!("{err:#}"),
                        "skipping unreadable consumos file"
                    );
                }
            }
        }

        let plan = plan_catalog(entries, &existing);
        let applied = store
            .apply_catalog(&plan.new_entries, &plan.touch_keys, Utc::now())
            .await?;
        outcome.inserted = applied.inserted;
        outcome.touched = applied.touched;
        outcome.by_branch = applied.by_branch;
        outcome.duplicates = plan.batch_repeats;

        outcome.cleanup_warnings = inbox.remove_consumed(&consumed);
        info!(
            inserted = outcome.inserted,
            touched = outcome.touched,
            files = outcome.files_read,
            "consumos ingested"
        );
        Ok(outcome)
    }

    async fn ingest_detalle(&self, store: &SalesStore, inbox: &Inbox) -> Result<CategoryOutcome> {
        let mut outcome = CategoryOutcome::default();
        let pending = inbox.pending(Category::Detalle)?;
        outcome.files_seen = pending.len();
        if pending.is_empty() {
            info!("no detalle files pending");
            return Ok(outcome);
        }

        let (shifts, cinta_files) = load_shift_index(inbox);

        let existing = store.detail_keys().await?;
        let mut rows: Vec<(DetailRow, String)> = Vec::new();
        let mut consumed: Vec<PathBuf> = Vec::new();
        for path in pending {
            match read_detail_file(&path) {
                Ok((tag, file_rows)) => {
                    outcome.files_read += 1;
                    outcome.rows_read += file_rows.len();
                    rows.extend(file_rows.into_iter().map(|row| (row, tag.sucursal.clone())));
                    consumed.push(path);
                }
                Err(err) => {
                    outcome.files_skipped += 1;
                    warn!(
                        path = %path.display(),
                        error = %format!("{err:#}"),
                        "skipping unreadable detalle file"
                    );
                }
            }
        }

        let (lines, stats) = enrich_details(rows, &shifts);
        outcome.missing_shift = stats.missing_shift;
        outcome.invalid_close = stats.invalid_close;

        let plan = plan_detail(lines, &existing);
        outcome.duplicates = plan.duplicates;
        let applied = store.insert_detail(&plan.new_lines).await?;
        outcome.inserted = applied.inserted;
        outcome.by_branch = applied.by_branch;

        // Cinta files are only consumed once at least one detail file made it
        // into the database alongside them.
        let mut to_remove = consumed;
        if outcome.files_read > 0 {
            to_remove.extend(cinta_files);
        }
        outcome.cleanup_warnings = inbox.remove_consumed(&to_remove);
        info!(
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            missing_shift = outcome.missing_shift,
            files = outcome.files_read,
            "detalle ingested"
        );
        Ok(outcome)
    }
}

/// Cron line (seconds-field form) for a daily run at the given time.
pub fn cron_expr(time: NaiveTime) -> String {
    format!("0 {} {} * * *", time.minute(), time.hour())
}

/// Build a scheduler carrying one daily ingestion job per configured time.
pub async fn build_scheduler(config: IngestConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating job scheduler")?;
    let config = Arc::new(config);
    for time in config.schedule_times.clone() {
        let expr = cron_expr(time);
        let config_job = Arc::clone(&config);
        let job = Job::new_async(expr.as_str(), move |_uuid, _lock| {
            let config = Arc::clone(&config_job);
            Box::pin(async move {
                let pipeline = IngestPipeline::new((*config).clone());
                match pipeline.run_once(RunSource::Scheduled).await {
                    Ok(report) => {
                        info!(
                            run_id = %report.run_id,
                            status = report.status_token(),
                            "scheduled run finished"
                        );
                    }
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "scheduled run failed");
                    }
                }
            })
        })
        .with_context(|| format!("scheduling daily run at {time}"))?;
        sched.add(job).await.context("adding job to scheduler")?;
        info!(%expr, "scheduled daily ingestion");
    }
    Ok(sched)
}

/// Run the scheduler until Ctrl-C, mirroring the desktop auto-run loop.
pub async fn run_scheduler_from_env() -> Result<()> {
    let config = IngestConfig::from_env();
    anyhow::ensure!(
        !config.schedule_times.is_empty(),
        "no valid schedule times configured"
    );
    let mut sched = build_scheduler(config.clone()).await?;
    sched.start().await.context("starting scheduler")?;

    let log = ExecutionLog::new(&config.log_path);
    if let Err(err) = log.append(Local::now(), RunSource::System, "programador iniciado") {
        warn!(error = %format!("{err:#}"), "could not append to execution log");
    }
    info!(times = config.schedule_times.len(), "scheduler running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    if let Err(err) = log.append(Local::now(), RunSource::System, "programador detenido") {
        warn!(error = %format!("{err:#}"), "could not append to execution log");
    }
    Ok(())
}
