//! Discovery of ficha files for a given period.
//!
//! The extraction stage deposits files named `MM-YYYY <nome da ficha>.xls`
//! in a shared directory. Import runs list that directory, keep only the
//! current period's `.xls` files and derive the ficha name from the file
//! name. Results are sorted by file name so a run always processes files
//! in the same order.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};

/// The (month, year) pair that scopes both file discovery and the wide
/// table's destructive reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub month: u32,
    pub year: i32,
}

impl Period {
    pub fn from_reference(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            year: date.year(),
        }
    }

    /// File-name prefix of the period, e.g. `01-2025`.
    pub fn prefix(&self) -> String {
        format!("{:02}-{:04}", self.month, self.year)
    }
}

/// A discovered export: full path plus the ficha name carried in the file
/// name.
#[derive(Debug, Clone, PartialEq)]
pub struct FichaFile {
    pub path: PathBuf,
    pub ficha: String,
}

/// Derive the ficha name from a file name: drop the `.xls` extension and
/// the period prefix, then trim.
pub fn ficha_name(file_name: &str, period: Period) -> String {
    let name = file_name.strip_suffix(".xls").unwrap_or(file_name);
    let name = name.strip_prefix(&period.prefix()).unwrap_or(name);
    name.trim().to_string()
}

pub fn list_ficha_files(dir: &Path, period: Period) -> Result<Vec<FichaFile>> {
    let prefix = period.prefix();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("could not list ficha directory '{}'", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.context("could not read directory entry")?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.ends_with(".xls") && file_name.starts_with(&prefix) {
            files.push(FichaFile {
                path: entry.path(),
                ficha: ficha_name(&file_name, period),
            });
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn period() -> Period {
        Period {
            month: 1,
            year: 2025,
        }
    }

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn prefix_is_zero_padded() {
        assert_eq!(period().prefix(), "01-2025");
        assert_eq!(
            Period {
                month: 11,
                year: 2024
            }
            .prefix(),
            "11-2024"
        );
    }

    #[test]
    fn from_reference_takes_month_and_year() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        assert_eq!(Period::from_reference(date), period());
    }

    #[test]
    fn ficha_name_strips_prefix_and_extension() {
        assert_eq!(
            ficha_name("01-2025 FICHA RECEPTIVO.xls", period()),
            "FICHA RECEPTIVO"
        );
        assert_eq!(
            ficha_name("01-2025 CNR - COBE - REGIONAL 2022.xls", period()),
            "CNR - COBE - REGIONAL 2022"
        );
        // No separating space after the prefix is tolerated.
        assert_eq!(ficha_name("01-2025FICHA X.xls", period()), "FICHA X");
    }

    #[test]
    fn lists_only_the_period_xls_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "01-2025 FICHA RECEPTIVO.xls");
        touch(dir.path(), "01-2025 FICHA ATIVO.xls");
        touch(dir.path(), "12-2024 FICHA RECEPTIVO.xls");
        touch(dir.path(), "01-2025 notas.txt");
        touch(dir.path(), "leia-me.xls");

        let files = list_ficha_files(dir.path(), period()).unwrap();
        let fichas: Vec<&str> = files.iter().map(|f| f.ficha.as_str()).collect();
        assert_eq!(fichas, vec!["FICHA ATIVO", "FICHA RECEPTIVO"]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let err = list_ficha_files(Path::new("/nonexistent/fichas"), period()).unwrap_err();
        assert!(err.to_string().contains("could not list"));
    }
}
