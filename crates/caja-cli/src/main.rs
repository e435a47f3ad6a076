use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use caja_ingest::{IngestConfig, IngestPipeline, RunReport};
use caja_store::{ExecutionLog, RunSource, RunStatusFile};

#[derive(Debug, Parser)]
#[command(name = "caja")]
#[command(about = "CAJA: ingesta y consulta de ventas por sucursal")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Procesar una vez los archivos pendientes en las carpetas de entrada.
    Ingest,
    /// Dejar corriendo las ingestas diarias programadas.
    Schedule,
    /// Servir la interfaz web de consulta.
    Serve,
    /// Mostrar el resultado de la última corrida.
    Status,
    /// Mostrar el log de ejecución.
    Log {
        /// Mostrar el log completo en lugar de las últimas líneas.
        #[arg(long)]
        todo: bool,
        /// Cantidad de líneas a mostrar.
        #[arg(long, default_value_t = 50)]
        lineas: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("CAJA_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_report(report: &RunReport) {
    println!("corrida {} [{}]", report.run_id, report.status_token());
    match &report.consumos.error {
        None => println!(
            "  consumos: {}/{} archivos, +{} nuevos, {} marcados, {} repetidos",
            report.consumos.files_read,
            report.consumos.files_seen,
            report.consumos.inserted,
            report.consumos.touched,
            report.consumos.duplicates
        ),
        Some(err) => println!("  consumos: ERROR: {err}"),
    }
    match &report.detalle.error {
        None => println!(
            "  detalle: {}/{} archivos, +{} nuevas, {} duplicadas, {} sin turno",
            report.detalle.files_read,
            report.detalle.files_seen,
            report.detalle.inserted,
            report.detalle.duplicates,
            report.detalle.missing_shift
        ),
        Some(err) => println!("  detalle: ERROR: {err}"),
    }
    for (sucursal, filas) in &report.consumos.by_branch {
        println!("    consumos {sucursal}: +{filas}");
    }
    for (sucursal, filas) in &report.detalle.by_branch {
        println!("    detalle {sucursal}: +{filas}");
    }
    println!(
        "  totales: {} artículos, {} líneas de ticket",
        report.total_consumos, report.total_detalle
    );
    if !report.report_path.is_empty() {
        println!("  resumen: {}", report.report_path);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let config = IngestConfig::from_env();
            let report = IngestPipeline::new(config)
                .run_once(RunSource::Manual)
                .await?;
            print_report(&report);
            if !report.exito() {
                anyhow::bail!("la corrida terminó con errores");
            }
        }
        Commands::Schedule => caja_ingest::run_scheduler_from_env().await?,
        Commands::Serve => caja_web::serve_from_env().await?,
        Commands::Status => {
            let config = IngestConfig::from_env();
            match RunStatusFile::new(&config.status_path).read()? {
                Some(last) => println!("{} [{}]", last.ran_at, last.status),
                None => println!("sin corridas registradas"),
            }
        }
        Commands::Log { todo, lineas } => {
            let config = IngestConfig::from_env();
            let log = ExecutionLog::new(&config.log_path);
            let lines = if todo { log.read_all()? } else { log.tail(lineas)? };
            if lines.is_empty() {
                println!("log vacío");
            }
            for line in lines {
                println!("{line}");
            }
        }
    }

    Ok(())
}
