//! Normalizer Service - Organizes fichas into the normalized monitoria schema
//!
//! Responsibilities:
//! - Load the four monitoria.* tables into in-memory snapshots at run start
//! - Get-or-create fichas, colunas and registros by their natural keys
//! - Insert registro_coluna values only when the (coluna, registro) pair is
//!   new; an existing value is never overwritten
//! - Gate the run through hist_bases (once per day, bounded retries)
//!
//! The schema is strictly additive: nothing is ever deleted or updated, so
//! re-running over the same exports produces no new rows. Existence checks
//! run against the snapshots instead of per-row queries; this holds because
//! a run only processes one period's exports, not arbitrary volumes.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::Parser;

use datamart::db::{Database, Value};
use datamart::diagnostic::diagnostico_erro;
use datamart::files::{list_ficha_files, Period};
use datamart::history::{check_run_permit, record_run, RunRecord};
use datamart::sheet::{parse_br_int, Sheet};

#[derive(Parser, Debug)]
#[command(
    name = "normalizer",
    about = "Organizes monitoring fichas into the monitoria schema"
)]
struct Args {
    /// Reference date (YYYY-MM-DD); defaults to yesterday
    #[arg(long)]
    reference_date: Option<String>,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    fichas_dir: PathBuf,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            fichas_dir: PathBuf::from(
                std::env::var("FICHAS_DIR").unwrap_or_else(|_| "./data/fichas".to_string()),
            ),
        })
    }
}

const JOB_NAME: &str = "fichas_normalizacao";

/// Column that identifies a registro within its ficha.
const NUM_MONITORIA: &str = "num_monitoria";

// =============================================================================
// SNAPSHOTS - in-memory copies of the monitoria.* tables
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct FichaRow {
    id: i32,
    nome_ficha: String,
    mes: i32,
    ano: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct ColunaRow {
    id: i32,
    nome_coluna: String,
    ficha_fk: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct RegistroRow {
    id: i32,
    num_monitoria: i64,
    ficha_fk: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct ValorRow {
    coluna_fk: i32,
    registro_fk: i32,
}

/// Index of the warehouse state, keyed by each table's natural key.
///
/// Ids created during the run are recorded here as well, so lookups see
/// both preloaded rows and rows inserted earlier in the same run.
#[derive(Debug, Default)]
struct Snapshot {
    fichas: HashMap<(String, i32, i32), i32>,
    colunas: HashMap<(i32, String), i32>,
    registros: HashMap<(i32, i64), i32>,
    valores: HashSet<(i32, i32)>,
}

impl Snapshot {
    fn from_rows(
        fichas: Vec<FichaRow>,
        colunas: Vec<ColunaRow>,
        registros: Vec<RegistroRow>,
        valores: Vec<ValorRow>,
    ) -> Self {
        Self {
            fichas: fichas
                .into_iter()
                .map(|f| ((f.nome_ficha, f.mes, f.ano), f.id))
                .collect(),
            colunas: colunas
                .into_iter()
                .map(|c| ((c.ficha_fk, c.nome_coluna), c.id))
                .collect(),
            registros: registros
                .into_iter()
                .map(|r| ((r.ficha_fk, r.num_monitoria), r.id))
                .collect(),
            valores: valores
                .into_iter()
                .map(|v| (v.coluna_fk, v.registro_fk))
                .collect(),
        }
    }

    async fn load(db: &Database) -> Result<Self> {
        let fichas: Vec<FichaRow> = db
            .fetch_all("SELECT id, nome_ficha, mes, ano FROM monitoria.fichas", &[])
            .await
            .context("failed to load monitoria.fichas")?;
        let colunas: Vec<ColunaRow> = db
            .fetch_all("SELECT id, nome_coluna, ficha_fk FROM monitoria.colunas", &[])
            .await
            .context("failed to load monitoria.colunas")?;
        let registros: Vec<RegistroRow> = db
            .fetch_all(
                "SELECT id, num_monitoria, ficha_fk FROM monitoria.registros",
                &[],
            )
            .await
            .context("failed to load monitoria.registros")?;
        let valores: Vec<ValorRow> = db
            .fetch_all(
                "SELECT coluna_fk, registro_fk FROM monitoria.registro_coluna",
                &[],
            )
            .await
            .context("failed to load monitoria.registro_coluna")?;
        Ok(Self::from_rows(fichas, colunas, registros, valores))
    }

    fn ficha_id(&self, nome_ficha: &str, period: Period) -> Option<i32> {
        self.fichas
            .get(&(nome_ficha.to_string(), period.month as i32, period.year))
            .copied()
    }

    fn remember_ficha(&mut self, nome_ficha: &str, period: Period, id: i32) {
        self.fichas
            .insert((nome_ficha.to_string(), period.month as i32, period.year), id);
    }

    fn coluna_id(&self, ficha_fk: i32, nome_coluna: &str) -> Option<i32> {
        self.colunas.get(&(ficha_fk, nome_coluna.to_string())).copied()
    }

    fn remember_coluna(&mut self, ficha_fk: i32, nome_coluna: &str, id: i32) {
        self.colunas.insert((ficha_fk, nome_coluna.to_string()), id);
    }

    fn registro_id(&self, ficha_fk: i32, num_monitoria: i64) -> Option<i32> {
        self.registros.get(&(ficha_fk, num_monitoria)).copied()
    }

    fn remember_registro(&mut self, ficha_fk: i32, num_monitoria: i64, id: i32) {
        self.registros.insert((ficha_fk, num_monitoria), id);
    }

    fn has_valor(&self, coluna_fk: i32, registro_fk: i32) -> bool {
        self.valores.contains(&(coluna_fk, registro_fk))
    }

    fn remember_valor(&mut self, coluna_fk: i32, registro_fk: i32) {
        self.valores.insert((coluna_fk, registro_fk));
    }
}

// =============================================================================
// GET-OR-CREATE
// =============================================================================

async fn ficha_fk(
    db: &Database,
    snapshot: &mut Snapshot,
    nome_ficha: &str,
    period: Period,
) -> Result<i32> {
    if let Some(id) = snapshot.ficha_id(nome_ficha, period) {
        return Ok(id);
    }
    let id = db
        .insert_returning_id(
            "INSERT INTO monitoria.fichas (nome_ficha, mes, ano) VALUES ($1, $2, $3) RETURNING id",
            &[
                Value::Text(nome_ficha.to_string()),
                Value::Int(period.month as i64),
                Value::Int(period.year as i64),
            ],
        )
        .await
        .with_context(|| format!("failed to insert ficha '{nome_ficha}'"))?;
    snapshot.remember_ficha(nome_ficha, period, id);
    Ok(id)
}

async fn coluna_fk(
    db: &Database,
    snapshot: &mut Snapshot,
    ficha_fk: i32,
    nome_coluna: &str,
) -> Result<i32> {
    if let Some(id) = snapshot.coluna_id(ficha_fk, nome_coluna) {
        return Ok(id);
    }
    let id = db
        .insert_returning_id(
            "INSERT INTO monitoria.colunas (nome_coluna, ficha_fk) VALUES ($1, $2) RETURNING id",
            &[
                Value::Text(nome_coluna.to_string()),
                Value::Int(ficha_fk as i64),
            ],
        )
        .await
        .with_context(|| format!("failed to insert coluna '{nome_coluna}'"))?;
    snapshot.remember_coluna(ficha_fk, nome_coluna, id);
    Ok(id)
}

async fn registro_fk(
    db: &Database,
    snapshot: &mut Snapshot,
    ficha_fk: i32,
    num_monitoria: i64,
) -> Result<i32> {
    if let Some(id) = snapshot.registro_id(ficha_fk, num_monitoria) {
        return Ok(id);
    }
    let id = db
        .insert_returning_id(
            "INSERT INTO monitoria.registros (num_monitoria, ficha_fk) VALUES ($1, $2) RETURNING id",
            &[Value::Int(num_monitoria), Value::Int(ficha_fk as i64)],
        )
        .await
        .with_context(|| format!("failed to insert registro {num_monitoria}"))?;
    snapshot.remember_registro(ficha_fk, num_monitoria, id);
    Ok(id)
}

/// Insert the value only when the (coluna, registro) pair is new. Returns
/// whether a row was inserted.
async fn insert_valor(
    db: &Database,
    snapshot: &mut Snapshot,
    coluna_fk: i32,
    registro_fk: i32,
    valor: &str,
) -> Result<bool> {
    if snapshot.has_valor(coluna_fk, registro_fk) {
        return Ok(false);
    }
    db.execute(
        "INSERT INTO monitoria.registro_coluna (coluna_fk, registro_fk, valor) VALUES ($1, $2, $3)",
        &[
            Value::Int(coluna_fk as i64),
            Value::Int(registro_fk as i64),
            Value::Text(valor.to_string()),
        ],
    )
    .await
    .context("failed to insert registro_coluna value")?;
    snapshot.remember_valor(coluna_fk, registro_fk);
    Ok(true)
}

// =============================================================================
// IMPORT
// =============================================================================

fn find_num_monitoria(sheet: &Sheet) -> Option<usize> {
    sheet
        .columns
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(NUM_MONITORIA))
}

#[derive(Debug, Default)]
struct ImportSummary {
    fichas: usize,
    registros: u64,
    valores: u64,
}

async fn run_import(db: &Database, config: &Config, period: Period) -> Result<ImportSummary> {
    let mut snapshot = Snapshot::load(db).await?;
    println!(
        "Snapshot loaded: {} ficha(s), {} coluna(s), {} registro(s), {} valor(es)",
        snapshot.fichas.len(),
        snapshot.colunas.len(),
        snapshot.registros.len(),
        snapshot.valores.len()
    );

    let files = list_ficha_files(&config.fichas_dir, period)?;
    println!(
        "Found {} ficha file(s) for {} in {}",
        files.len(),
        period.prefix(),
        config.fichas_dir.display()
    );

    let mut summary = ImportSummary::default();
    for file in &files {
        println!("\n[{}] {}", file.ficha, file.path.display());

        let bytes = tokio::fs::read(&file.path)
            .await
            .with_context(|| format!("could not read '{}'", file.path.display()))?;
        let sheet = Sheet::parse_html(&bytes)
            .with_context(|| format!("could not parse '{}'", file.path.display()))?;

        let ficha_id = ficha_fk(db, &mut snapshot, &file.ficha, period).await?;

        // Explicit column -> id mapping in sheet order; cells keep their
        // position, only the target identifier is resolved.
        let mut mapped: Vec<(i32, usize)> = Vec::with_capacity(sheet.width());
        for (index, column) in sheet.columns.iter().enumerate() {
            let id = coluna_fk(db, &mut snapshot, ficha_id, &column.name).await?;
            mapped.push((id, index));
        }

        let num_index = find_num_monitoria(&sheet)
            .with_context(|| format!("ficha '{}' has no {NUM_MONITORIA} column", file.ficha))?;

        let mut new_registros = 0u64;
        let mut new_valores = 0u64;
        for row in 0..sheet.height() {
            let raw = &sheet.columns[num_index].cells[row];
            let num_monitoria = parse_br_int(raw).with_context(|| {
                format!(
                    "invalid {NUM_MONITORIA} '{raw}' in ficha '{}' row {}",
                    file.ficha,
                    row + 1
                )
            })?;

            let existed = snapshot.registro_id(ficha_id, num_monitoria).is_some();
            let registro_id = registro_fk(db, &mut snapshot, ficha_id, num_monitoria).await?;
            if !existed {
                new_registros += 1;
            }

            for (coluna_id, column_index) in &mapped {
                let valor = &sheet.columns[*column_index].cells[row];
                if insert_valor(db, &mut snapshot, *coluna_id, registro_id, valor).await? {
                    new_valores += 1;
                }
            }
        }

        println!("  {new_registros} new registro(s), {new_valores} new valor(es)");
        summary.fichas += 1;
        summary.registros += new_registros;
        summary.valores += new_valores;
    }

    Ok(summary)
}

fn print_summary(summary: &ImportSummary) {
    println!("\n=== Normalization Summary ===");
    println!("Fichas processed: {}", summary.fichas);
    println!("New registros: {}", summary.registros);
    println!("New valores: {}", summary.valores);
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

    println!("=== Fichas Normalizer ===");
    println!("Reference date: {reference}");
    println!("Period: {}", period.prefix());

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to connect to the datamart")?;

    let today = Local::now().date_naive();
    let permit = check_run_permit(&db, JOB_NAME, today).await?;
    if !permit.permitted {
        println!("'{JOB_NAME}' already succeeded today or exhausted its retries - nothing to do");
        return Ok(());
    }

    let started = Instant::now();
    let carimbo_tempo = Local::now().naive_local();
    let result = run_import(&db, &config, period).await;

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

#[cfg(test)]
mod tests {
    use super::*;
    use datamart::sheet::Column;

    fn period() -> Period {
        Period {
            month: 1,
            year: 2025,
        }
    }

    fn loaded_snapshot() -> Snapshot {
        Snapshot::from_rows(
            vec![FichaRow {
                id: 10,
                nome_ficha: "FICHA RECEPTIVO".to_string(),
                mes: 1,
                ano: 2025,
            }],
            vec![ColunaRow {
                id: 100,
                nome_coluna: "MATRICULA".to_string(),
                ficha_fk: 10,
            }],
            vec![RegistroRow {
                id: 1000,
                num_monitoria: 123456,
                ficha_fk: 10,
            }],
            vec![ValorRow {
                coluna_fk: 100,
                registro_fk: 1000,
            }],
        )
    }

    #[test]
    fn snapshot_lookups_use_the_natural_keys() {
        let snapshot = loaded_snapshot();
        assert_eq!(snapshot.ficha_id("FICHA RECEPTIVO", period()), Some(10));
        assert_eq!(snapshot.coluna_id(10, "MATRICULA"), Some(100));
        assert_eq!(snapshot.registro_id(10, 123456), Some(1000));
        assert!(snapshot.has_valor(100, 1000));
    }

    #[test]
    fn different_period_is_a_different_ficha() {
        let snapshot = loaded_snapshot();
        let other = Period {
            month: 2,
            year: 2025,
        };
        assert_eq!(snapshot.ficha_id("FICHA RECEPTIVO", other), None);
        assert_eq!(snapshot.ficha_id("FICHA ATIVO", period()), None);
    }

    #[test]
    fn keys_do_not_leak_across_fichas() {
        let snapshot = loaded_snapshot();
        assert_eq!(snapshot.coluna_id(11, "MATRICULA"), None);
        assert_eq!(snapshot.registro_id(11, 123456), None);
        assert!(!snapshot.has_valor(100, 1001));
        assert!(!snapshot.has_valor(101, 1000));
    }

    #[test]
    fn inserted_ids_are_visible_to_later_lookups() {
        let mut snapshot = Snapshot::default();
        assert_eq!(snapshot.ficha_id("FICHA ATIVO", period()), None);

        snapshot.remember_ficha("FICHA ATIVO", period(), 11);
        snapshot.remember_coluna(11, "NUM_MONITORIA", 101);
        snapshot.remember_registro(11, 42, 1001);
        snapshot.remember_valor(101, 1001);

        assert_eq!(snapshot.ficha_id("FICHA ATIVO", period()), Some(11));
        assert_eq!(snapshot.coluna_id(11, "NUM_MONITORIA"), Some(101));
        assert_eq!(snapshot.registro_id(11, 42), Some(1001));
        assert!(snapshot.has_valor(101, 1001));
    }

    /// Walk a parsed sheet against the snapshot the way run_import does,
    /// counting the inserts that would be issued.
    fn plan_inserts(snapshot: &mut Snapshot, sheet: &Sheet, ficha: &str, next_id: &mut i32) -> usize {
        let mut inserts = 0;
        let fresh = |snapshot_id: Option<i32>, next_id: &mut i32, inserts: &mut usize| match snapshot_id {
            Some(id) => id,
            None => {
                *next_id += 1;
                *inserts += 1;
                *next_id
            }
        };

        let ficha_id = {
            let found = snapshot.ficha_id(ficha, period());
            let id = fresh(found, next_id, &mut inserts);
            snapshot.remember_ficha(ficha, period(), id);
            id
        };
        let mut mapped = Vec::new();
        for (index, column) in sheet.columns.iter().enumerate() {
            let found = snapshot.coluna_id(ficha_id, &column.name);
            let id = fresh(found, next_id, &mut inserts);
            snapshot.remember_coluna(ficha_id, &column.name, id);
            mapped.push((id, index));
        }
        let num_index = find_num_monitoria(sheet).unwrap();
        for row in 0..sheet.height() {
            let num = parse_br_int(&sheet.columns[num_index].cells[row]).unwrap();
            let found = snapshot.registro_id(ficha_id, num);
            let registro_id = fresh(found, next_id, &mut inserts);
            snapshot.remember_registro(ficha_id, num, registro_id);
            for (coluna_id, _) in &mapped {
                if !snapshot.has_valor(*coluna_id, registro_id) {
                    snapshot.remember_valor(*coluna_id, registro_id);
                    inserts += 1;
                }
            }
        }
        inserts
    }

    fn sample_sheet() -> Sheet {
        Sheet {
            columns: vec![
                Column {
                    name: "NUM_MONITORIA".to_string(),
                    cells: vec!["1".to_string(), "2".to_string()],
                },
                Column {
                    name: "MATRICULA".to_string(),
                    cells: vec!["1001".to_string(), "1002".to_string()],
                },
            ],
        }
    }

    #[test]
    fn reprocessing_the_same_sheet_plans_no_inserts() {
        let mut snapshot = Snapshot::default();
        let mut next_id = 0;

        // 1 ficha + 2 colunas + 2 registros + 4 valores
        let first = plan_inserts(&mut snapshot, &sample_sheet(), "FICHA RECEPTIVO", &mut next_id);
        assert_eq!(first, 9);

        let second = plan_inserts(&mut snapshot, &sample_sheet(), "FICHA RECEPTIVO", &mut next_id);
        assert_eq!(second, 0);
    }

    #[test]
    fn a_new_row_in_a_known_ficha_only_adds_its_own_rows() {
        let mut snapshot = Snapshot::default();
        let mut next_id = 0;
        plan_inserts(&mut snapshot, &sample_sheet(), "FICHA RECEPTIVO", &mut next_id);

        let mut grown = sample_sheet();
        grown.columns[0].cells.push("3".to_string());
        grown.columns[1].cells.push("1003".to_string());

        // 1 registro + 2 valores
        let inserts = plan_inserts(&mut snapshot, &grown, "FICHA RECEPTIVO", &mut next_id);
        assert_eq!(inserts, 3);
    }

    #[test]
    fn num_monitoria_is_found_case_insensitively() {
        let sheet = sample_sheet();
        assert_eq!(find_num_monitoria(&sheet), Some(0));

        let lower = Sheet {
            columns: vec![Column {
                name: "num_monitoria".to_string(),
                cells: vec![],
            }],
        };
        assert_eq!(find_num_monitoria(&lower), Some(0));

        let missing = Sheet {
            columns: vec![Column {
                name: "MATRICULA".to_string(),
                cells: vec![],
            }],
        };
        assert_eq!(find_num_monitoria(&missing), None);
    }
}
