//! Importer Service - Loads monitoring fichas into the datamart wide table
//!
//! Responsibilities:
//! - Discover the period's ficha exports (MM-YYYY <nome>.xls, HTML tables)
//! - Reconcile each export's ad-hoc columns onto the fixed 11-column schema
//! - Coerce dates and numbers (Brazilian formats)
//! - Reset the period in public.fichas_monitoria, then insert every row
//! - Gate the whole run through hist_bases (once per day, bounded retries)
//!
//! A ficha whose columns cannot be reconciled is skipped with a printed
//! diagnostic and the run continues; a cell that fails type coercion aborts
//! the run.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::Parser;
use serde::Deserialize;

use datamart::db::{Database, Value};
use datamart::diagnostic::diagnostico_erro;
use datamart::files::{list_ficha_files, Period};
use datamart::history::{check_run_permit, record_run, RunRecord};
use datamart::sheet::{parse_br_float, parse_br_int, Sheet};

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Imports monitoring fichas into the datamart wide table")]
struct Args {
    /// Reference date (YYYY-MM-DD); defaults to yesterday
    #[arg(long)]
    reference_date: Option<String>,

    /// Parse and validate the period's files without touching the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    fichas_dir: PathBuf,
    excecoes_path: Option<String>,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            fichas_dir: PathBuf::from(
                std::env::var("FICHAS_DIR").unwrap_or_else(|_| "./data/fichas".to_string()),
            ),
            excecoes_path: std::env::var("FICHAS_EXCECOES").ok(),
        })
    }
}

const JOB_NAME: &str = "fichas_importacao";
const TARGET_TABLE: &str = "public.fichas_monitoria";

// =============================================================================
// COLUMN RECONCILIATION - maps each export's columns onto the fixed schema
// =============================================================================

/// Identifying fields every ficha must carry, in canonical order.
const FIXED_COLUMNS: &[&str] = &[
    "matricula",
    "nome_funcionario",
    "data da monitoria",
    "data_ligacao",
    "cod_monitoria",
    "num_monitoria",
    "perfil_monitoria",
    "nome_monitor",
];

const KW_ASSERTIVIDADE: &str = "assertividade";
const KW_DISTRIBUIDORA: &str = "distribuidora";
const KW_PROTOCOLO: &str = "protocolo";

/// 8 fixed fields plus the assertividade/distribuidora/protocolo triple.
const EXPECTED_COLUMNS: usize = 11;

const DATETIME_FORMAT: &str = "%d/%m/%Y %H:%M";
const DATE_FORMAT: &str = "%d/%m/%Y";

/// Fichas known to export duplicate keyword columns. For a listed ficha the
/// first (lowest-index) candidate wins; any other ficha with duplicates is
/// rejected. New exceptions are added to the FICHAS_EXCECOES JSON file, not
/// to the code.
#[derive(Debug, Clone, Deserialize)]
struct ExceptionConfig {
    #[serde(default)]
    assertividade_duplicadas: Vec<String>,
    #[serde(default)]
    distribuidora_duplicadas: Vec<String>,
}

impl Default for ExceptionConfig {
    fn default() -> Self {
        Self {
            assertividade_duplicadas: vec![
                "CNR - COBE - REGIONAL 2022".to_string(),
                "CNR - SCOB - REGIONAL 2022".to_string(),
            ],
            distribuidora_duplicadas: vec![
                "FICHA - HABILIDADE DE TRATAMENTO 2025 - NOTA RC".to_string(),
                "FICHA DA REC. HABILIDADE DE TRATAMENTO - NOTA RC".to_string(),
            ],
        }
    }
}

impl ExceptionConfig {
    fn load(path: Option<&str>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("could not read exception config '{path}'"))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("could not parse exception config '{path}'"))
            }
        }
    }

    fn first_assertividade(&self, ficha: &str) -> bool {
        self.assertividade_duplicadas.iter().any(|f| f == ficha)
    }

    fn first_distribuidora(&self, ficha: &str) -> bool {
        self.distribuidora_duplicadas.iter().any(|f| f == ficha)
    }
}

/// Why a file was refused. Rejections skip the file and let the run
/// continue; they are not errors.
#[derive(Debug, Clone, PartialEq)]
enum Rejection {
    AmbiguousField {
        field: &'static str,
        candidates: usize,
        ficha: String,
    },
    ColumnCount {
        found: usize,
        names: Vec<String>,
        ficha: String,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::AmbiguousField {
                field,
                candidates,
                ficha,
            } => write!(
                f,
                "AMBIGUITY: {candidates} '{field}' column(s) found for ficha '{ficha}', cannot pick one"
            ),
            Rejection::ColumnCount {
                found,
                names,
                ficha,
            } => write!(
                f,
                "ficha '{ficha}' reconciled to {found} column(s) (expected {EXPECTED_COLUMNS}): {names:?}"
            ),
        }
    }
}

/// A reconciled export: exactly the 11 target columns in canonical order,
/// cells still unparsed. `None` marks a synthesized null cell.
#[derive(Debug, Clone, PartialEq)]
struct NamedColumn {
    name: String,
    cells: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq)]
struct ReconciledSheet {
    columns: Vec<NamedColumn>,
}

/// Indices of the columns whose (lowercased) name contains the keyword.
fn candidate_indices(names: &[String], keyword: &str) -> Vec<usize> {
    names
        .iter()
        .enumerate()
        .filter(|(_, name)| name.contains(keyword))
        .map(|(index, _)| index)
        .collect()
}

fn select_column(sheet: &Sheet, index: usize, names: &[String]) -> NamedColumn {
    NamedColumn {
        name: names[index].clone(),
        cells: sheet.columns[index].cells.iter().cloned().map(Some).collect(),
    }
}

/// Map a parsed export onto the fixed target schema.
///
/// Output order is always: the 8 fixed fields, then assertividade,
/// distribuidora, protocolo. The trailing triple at positions -3/-2/-1 is
/// relied on by type coercion and renaming.
fn reconcile(
    sheet: &Sheet,
    ficha: &str,
    excecoes: &ExceptionConfig,
) -> Result<ReconciledSheet, Rejection> {
    let height = sheet.height();
    let names: Vec<String> = sheet.columns.iter().map(|c| c.name.to_lowercase()).collect();

    let assertividade = candidate_indices(&names, KW_ASSERTIVIDADE);
    let distribuidora = candidate_indices(&names, KW_DISTRIBUIDORA);
    let protocolo = candidate_indices(&names, KW_PROTOCOLO);

    // Assertividade must resolve to exactly one column; listed fichas with
    // duplicates take the first match.
    let assertividade_index = match assertividade.as_slice() {
        [only] => *only,
        [first, ..] if excecoes.first_assertividade(ficha) => *first,
        other => {
            return Err(Rejection::AmbiguousField {
                field: KW_ASSERTIVIDADE,
                candidates: other.len(),
                ficha: ficha.to_string(),
            })
        }
    };

    // Distribuidora is optional; absence synthesizes an empty column below.
    let distribuidora_index = match distribuidora.as_slice() {
        [] => None,
        [only] => Some(*only),
        [first, ..] if excecoes.first_distribuidora(ficha) => Some(*first),
        other => {
            return Err(Rejection::AmbiguousField {
                field: KW_DISTRIBUIDORA,
                candidates: other.len(),
                ficha: ficha.to_string(),
            })
        }
    };

    // Protocolo is optional and never ambiguous: first match wins.
    let protocolo_index = protocolo.first().copied();

    let mut columns: Vec<NamedColumn> = Vec::with_capacity(EXPECTED_COLUMNS);
    for fixed in FIXED_COLUMNS {
        if let Some(position) = names.iter().position(|name| name == fixed) {
            columns.push(select_column(sheet, position, &names));
        }
    }
    columns.push(select_column(sheet, assertividade_index, &names));
    match distribuidora_index {
        Some(index) => columns.push(select_column(sheet, index, &names)),
        None => columns.push(NamedColumn {
            name: KW_DISTRIBUIDORA.to_string(),
            cells: vec![Some(String::new()); height],
        }),
    }
    match protocolo_index {
        Some(index) => columns.push(select_column(sheet, index, &names)),
        None => columns.push(NamedColumn {
            name: KW_PROTOCOLO.to_string(),
            cells: vec![None; height],
        }),
    }

    // Acceptance gate: anything other than the 11 expected columns (a fixed
    // field missing from the export) refuses the whole file.
    if columns.len() != EXPECTED_COLUMNS {
        return Err(Rejection::ColumnCount {
            found: columns.len(),
            names: columns.into_iter().map(|c| c.name).collect(),
            ficha: ficha.to_string(),
        });
    }

    Ok(ReconciledSheet { columns })
}

// =============================================================================
// TYPE COERCION AND DATAMART RENAMING
// =============================================================================

/// Typed, schema-conformant rows ready for insertion. Column-major, aligned
/// with `columns`.
#[derive(Debug, Clone, PartialEq)]
struct Frame {
    columns: Vec<String>,
    cells: Vec<Vec<Value>>,
}

impl Frame {
    fn height(&self) -> usize {
        self.cells.first().map(|c| c.len()).unwrap_or(0)
    }

    fn row(&self, index: usize) -> Vec<Value> {
        self.cells.iter().map(|column| column[index].clone()).collect()
    }

    fn rename(&mut self, from: &str, to: &str) {
        if let Some(position) = self.columns.iter().position(|name| name == from) {
            self.columns[position] = to.to_string();
        }
    }

    fn push_const(&mut self, name: &str, value: Value) {
        let height = self.height();
        self.columns.push(name.to_string());
        self.cells.push(vec![value; height]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CellKind {
    Int,
    Float,
    DateTime,
    Date,
    Text,
}

/// The assertividade column is identified by its trailing position, not by
/// name; everything else coerces by the fixed field names.
fn column_kind(position: usize, name: &str, width: usize) -> CellKind {
    if position == width - 3 {
        return CellKind::Float;
    }
    match name {
        "matricula" | "cod_monitoria" | "num_monitoria" => CellKind::Int,
        "data da monitoria" => CellKind::DateTime,
        "data_ligacao" => CellKind::Date,
        _ => CellKind::Text,
    }
}

fn coerce_cell(kind: CellKind, cell: &Option<String>) -> Result<Value> {
    let raw = match cell {
        None => return Ok(Value::Null),
        Some(raw) => raw,
    };
    match kind {
        CellKind::Text => Ok(Value::Text(raw.clone())),
        CellKind::Int => parse_br_int(raw).map(Value::Int),
        CellKind::Float => parse_br_float(raw).map(Value::Float),
        CellKind::DateTime => NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
            .map(Value::Timestamp)
            .with_context(|| format!("could not parse date-time from '{raw}'")),
        CellKind::Date => NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map(Value::Date)
            .with_context(|| format!("could not parse date from '{raw}'")),
    }
}

/// Coerce every cell to its target type. Any failure aborts the file's
/// import (and with it the run).
fn coerce_types(sheet: &ReconciledSheet) -> Result<Frame> {
    let width = sheet.columns.len();
    let mut columns = Vec::with_capacity(width);
    let mut cells = Vec::with_capacity(width);

    for (position, column) in sheet.columns.iter().enumerate() {
        let kind = column_kind(position, &column.name, width);
        let mut parsed = Vec::with_capacity(column.cells.len());
        for (row, cell) in column.cells.iter().enumerate() {
            let value = coerce_cell(kind, cell)
                .with_context(|| format!("column '{}', row {}", column.name, row + 1))?;
            parsed.push(value);
        }
        columns.push(column.name.clone());
        cells.push(parsed);
    }

    Ok(Frame { columns, cells })
}

/// Rename the dynamic trailing triple by position and the two fixed fields
/// whose export names differ from the datamart's.
fn rename_to_datamart(frame: &mut Frame) {
    let width = frame.columns.len();
    frame.columns[width - 3] = "assertividade".to_string();
    frame.columns[width - 2] = "distribuidora".to_string();
    frame.columns[width - 1] = "protocolo".to_string();
    frame.rename("nome_funcionario", "nome_do_funcionario");
    frame.rename("data da monitoria", "data_da_monitoria");
}

/// Constant-valued columns identifying the ficha and the period.
fn append_metadata(frame: &mut Frame, ficha: &str, period: Period) {
    frame.push_const("tipo_da_ficha", Value::Text(ficha.to_string()));
    frame.push_const("ano", Value::Int(period.year as i64));
    frame.push_const("mes", Value::Int(period.month as i64));
}

// =============================================================================
// ORCHESTRATION
// =============================================================================

#[derive(Debug, Default)]
struct ImportSummary {
    processed: usize,
    skipped: usize,
    inserted: u64,
}

fn build_insert_sql(columns: &[String]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    format!(
        "INSERT INTO {TARGET_TABLE} ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    )
}

async fn insert_frame(db: &Database, frame: &Frame) -> Result<u64> {
    let sql = build_insert_sql(&frame.columns);
    let mut inserted = 0;
    for row_index in 0..frame.height() {
        let row = frame.row(row_index);
        db.execute(&sql, &row)
            .await
            .with_context(|| format!("failed to insert row {} into {TARGET_TABLE}", row_index + 1))?;
        inserted += 1;
    }
    Ok(inserted)
}

/// Remove the period's rows before reloading them; the wide table has no
/// uniqueness constraint, so a reload without the reset would duplicate.
async fn reset_period(db: &Database, period: Period) -> Result<()> {
    db.execute(
        &format!("DELETE FROM {TARGET_TABLE} WHERE ano = $1 AND mes = $2"),
        &[
            Value::Int(period.year as i64),
            Value::Int(period.month as i64),
        ],
    )
    .await
    .with_context(|| format!("failed to reset period {} in {TARGET_TABLE}", period.prefix()))?;
    Ok(())
}

async fn run_import(
    db: &Database,
    config: &Config,
    period: Period,
    dry_run: bool,
) -> Result<ImportSummary> {
    let excecoes = ExceptionConfig::load(config.excecoes_path.as_deref())?;
    let files = list_ficha_files(&config.fichas_dir, period)?;
    println!(
        "Found {} ficha file(s) for {} in {}",
        files.len(),
        period.prefix(),
        config.fichas_dir.display()
    );

    if !dry_run {
        reset_period(db, period).await?;
        println!("Period {} reset in {TARGET_TABLE}", period.prefix());
    }

    let mut summary = ImportSummary::default();
    for file in &files {
        println!("\n[{}] {}", file.ficha, file.path.display());

        let bytes = tokio::fs::read(&file.path)
            .await
            .with_context(|| format!("could not read '{}'", file.path.display()))?;
        let sheet = Sheet::parse_html(&bytes)
            .with_context(|| format!("could not parse '{}'", file.path.display()))?;

        let reconciled = match reconcile(&sheet, &file.ficha, &excecoes) {
            Ok(reconciled) => reconciled,
            Err(rejection) => {
                eprintln!("  skipping: {rejection}");
                summary.skipped += 1;
                continue;
            }
        };

        let mut frame = coerce_types(&reconciled)
            .with_context(|| format!("type coercion failed for ficha '{}'", file.ficha))?;
        rename_to_datamart(&mut frame);
        append_metadata(&mut frame, &file.ficha, period);

        if dry_run {
            println!("  dry run - {} row(s) validated", frame.height());
        } else {
            let rows = insert_frame(db, &frame).await?;
            println!("  {rows} row(s) inserted");
            summary.inserted += rows;
        }
        summary.processed += 1;
    }

    Ok(summary)
}

fn print_summary(summary: &ImportSummary) {
    println!("\n=== Import Summary ===");
    println!("Fichas processed: {}", summary.processed);
    println!("Fichas skipped: {}", summary.skipped);
    println!("Rows inserted: {}", summary.inserted);
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    let reference = match &args.reference_date {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .context("invalid --reference-date, expected YYYY-MM-DD")?,
        None => Local::now()
            .date_naive()
            .pred_opt()
            .context("could not compute yesterday's date")?,
    };
    let period = Period::from_reference(reference);

    println!("=== Fichas Importer ===");
    println!("Reference date: {reference}");
    println!("Period: {}", period.prefix());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to connect to the datamart")?;

    if args.dry_run {
        let summary = run_import(&db, &config, period, true).await?;
        print_summary(&summary);
        return Ok(());
    }

    let today = Local::now().date_naive();
    let permit = check_run_permit(&db, JOB_NAME, today).await?;
    if !permit.permitted {
        println!("'{JOB_NAME}' already succeeded today or exhausted its retries - nothing to do");
        return Ok(());
    }

    let started = Instant::now();
    let carimbo_tempo = Local::now().naive_local();
    let result = run_import(&db, &config, period, false).await;

    let record = match &result {
        Ok(_) => RunRecord {
            nome_do_relatorio: JOB_NAME.to_string(),
            carimbo_tempo,
            tempo_de_extracao_seg: started.elapsed().as_secs_f64(),
            concluido: true,
            tentativa: permit.attempt,
            msg_erro: None,
        },
        Err(err) => RunRecord {
            nome_do_relatorio: JOB_NAME.to_string(),
            carimbo_tempo,
            tempo_de_extracao_seg: started.elapsed().as_secs_f64(),
            concluido: false,
            tentativa: permit.attempt + 1,
            msg_erro: Some(diagnostico_erro(err)),
        },
    };
    record_run(&db, &record).await?;

    let summary = result?;
    print_summary(&summary);
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
