//! Parsing of the ficha exports.
//!
//! The source system saves monitoring fichas as `.xls` files that are in
//! fact HTML documents with a single `<table>`. A parsed [`Sheet`] is an
//! ordered list of named columns, each an ordered sequence of string cells;
//! empty cells stay empty strings. Same bytes, same sheet.

use anyhow::{anyhow, bail, Context, Result};
use encoding_rs::WINDOWS_1252;
use scraper::{ElementRef, Html, Selector};

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub columns: Vec<Column>,
}

impl Sheet {
    /// Parse the first HTML table of the document into a sheet.
    ///
    /// The exports come UTF-8 or WINDOWS-1252 encoded depending on the
    /// source system's mood; bytes that are not valid UTF-8 are decoded as
    /// WINDOWS-1252. Data rows shorter than the header are padded with
    /// empty cells, longer rows are truncated to the header width.
    pub fn parse_html(bytes: &[u8]) -> Result<Sheet> {
        let text = decode(bytes);
        let document = Html::parse_document(&text);

        let table_sel = selector("table")?;
        let row_sel = selector("tr")?;
        let cell_sel = selector("th, td")?;

        let table = document
            .select(&table_sel)
            .next()
            .context("no <table> found in ficha export")?;

        let mut rows = table.select(&row_sel);
        let header = rows.next().context("ficha table has no header row")?;
        let names = row_texts(&header, &cell_sel);
        if names.is_empty() {
            bail!("ficha table header row has no cells");
        }

        let mut columns: Vec<Column> = names
            .into_iter()
            .map(|name| Column {
                name,
                cells: Vec::new(),
            })
            .collect();

        for row in rows {
            let cells = row_texts(&row, &cell_sel);
            for (index, column) in columns.iter_mut().enumerate() {
                column.cells.push(cells.get(index).cloned().unwrap_or_default());
            }
        }

        Ok(Sheet { columns })
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn height(&self) -> usize {
        self.columns.first().map(|c| c.cells.len()).unwrap_or(0)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => WINDOWS_1252.decode(bytes).0.into_owned(),
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector '{css}': {e}"))
}

fn row_texts(row: &ElementRef, cell_sel: &Selector) -> Vec<String> {
    row.select(cell_sel).map(|cell| cell_text(&cell)).collect()
}

fn cell_text(cell: &ElementRef) -> String {
    cell.text()
        .collect::<String>()
        .replace('\u{a0}', " ")
        .trim()
        .to_string()
}

/// Parse a number in the export's Brazilian format: `.` separates
/// thousands, `,` is the decimal mark.
pub fn parse_br_float(raw: &str) -> Result<f64> {
    let cleaned = raw.trim().replace('.', "").replace(',', ".");
    if cleaned.is_empty() {
        bail!("empty cell where a number was expected");
    }
    cleaned
        .parse::<f64>()
        .with_context(|| format!("could not parse number from '{raw}'"))
}

/// Like [`parse_br_float`] but the value must be integral.
pub fn parse_br_int(raw: &str) -> Result<i64> {
    let value = parse_br_float(raw)?;
    if value.fract() != 0.0 {
        bail!("expected an integer, got '{raw}'");
    }
    Ok(value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FICHA_HTML: &str = "<html><body><table>\
        <tr><th>MATRICULA</th><th>NOME_FUNCIONARIO</th><th>ASSERTIVIDADE FINAL</th></tr>\
        <tr><td>1001</td><td>Maria Souza</td><td>95,5</td></tr>\
        <tr><td>1002</td><td>Joao Lima</td><td>87</td></tr>\
        </table></body></html>";

    #[test]
    fn parses_header_and_cells_in_order() {
        let sheet = Sheet::parse_html(FICHA_HTML.as_bytes()).unwrap();
        assert_eq!(
            sheet.column_names(),
            vec!["MATRICULA", "NOME_FUNCIONARIO", "ASSERTIVIDADE FINAL"]
        );
        assert_eq!(sheet.height(), 2);
        assert_eq!(sheet.columns[0].cells, vec!["1001", "1002"]);
        assert_eq!(sheet.columns[2].cells, vec!["95,5", "87"]);
    }

    #[test]
    fn determinism_same_bytes_same_sheet() {
        let a = Sheet::parse_html(FICHA_HTML.as_bytes()).unwrap();
        let b = Sheet::parse_html(FICHA_HTML.as_bytes()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn short_rows_are_padded_and_long_rows_truncated() {
        let html = "<table>\
            <tr><td>a</td><td>b</td></tr>\
            <tr><td>1</td></tr>\
            <tr><td>2</td><td>3</td><td>4</td></tr>\
            </table>";
        let sheet = Sheet::parse_html(html.as_bytes()).unwrap();
        assert_eq!(sheet.width(), 2);
        assert_eq!(sheet.columns[0].cells, vec!["1", "2"]);
        assert_eq!(sheet.columns[1].cells, vec!["", "3"]);
    }

    #[test]
    fn nbsp_and_whitespace_are_normalized() {
        let html = "<table><tr><th>\u{a0}num_monitoria \u{a0}</th></tr>\
            <tr><td>  42 </td></tr></table>";
        let sheet = Sheet::parse_html(html.as_bytes()).unwrap();
        assert_eq!(sheet.columns[0].name, "num_monitoria");
        assert_eq!(sheet.columns[0].cells[0], "42");
    }

    #[test]
    fn windows_1252_bytes_are_decoded() {
        let html = b"<table><tr><th>fun\xe7\xe3o</th></tr><tr><td>ok</td></tr></table>";
        let sheet = Sheet::parse_html(html).unwrap();
        assert_eq!(sheet.columns[0].name, "função");
    }

    #[test]
    fn document_without_table_is_an_error() {
        let err = Sheet::parse_html(b"<html><p>nada</p></html>").unwrap_err();
        assert!(err.to_string().contains("no <table>"));
    }

    #[test]
    fn empty_cells_stay_empty_strings() {
        let html = "<table><tr><th>protocolo</th><th>x</th></tr>\
            <tr><td></td><td>1</td></tr></table>";
        let sheet = Sheet::parse_html(html.as_bytes()).unwrap();
        assert_eq!(sheet.columns[0].cells[0], "");
    }

    #[test]
    fn br_float_handles_thousands_and_decimal_marks() {
        assert_eq!(parse_br_float("1.234,56").unwrap(), 1234.56);
        assert_eq!(parse_br_float("95,5").unwrap(), 95.5);
        assert_eq!(parse_br_float("100").unwrap(), 100.0);
        assert_eq!(parse_br_float(" 7 ").unwrap(), 7.0);
        assert!(parse_br_float("").is_err());
        assert!(parse_br_float("abc").is_err());
    }

    #[test]
    fn br_int_rejects_fractions() {
        assert_eq!(parse_br_int("1.234").unwrap(), 1234);
        assert_eq!(parse_br_int("42").unwrap(), 42);
        assert!(parse_br_int("42,7").is_err());
    }
}
