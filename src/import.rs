use serde_json::{json, Value};

use crate::student::EDITABLE_FIELDS;

/// One parsed roster line: editable-field name -> non-empty cell value.
#[derive(Debug, Clone)]
pub struct RosterRow {
    pub line_no: usize,
    pub fields: Vec<(String, String)>,
}

impl RosterRow {
    pub fn value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
pub struct RosterParse {
    pub rows: Vec<RosterRow>,
    pub warnings: Vec<Value>,
    pub rows_total: usize,
}

/// Parse a roster CSV. The first line is a header of editable column names
/// (`nisn` and `nama` are mandatory columns); unknown columns are ignored
/// with a warning, empty cells are treated as absent.
pub fn parse_roster(text: &str) -> Result<RosterParse, String> {
    let mut lines = text.lines().enumerate();

    let header_cells = loop {
        match lines.next() {
            Some((_, raw)) if raw.trim().is_empty() => continue,
            Some((_, raw)) => break parse_csv_record(raw),
            None => return Err("roster file is empty".to_string()),
        }
    };

    let mut warnings: Vec<Value> = Vec::new();
    // column index -> editable field name; None for ignored columns
    let mut columns: Vec<Option<String>> = Vec::new();
    for cell in &header_cells {
        let name = cell.trim().to_ascii_lowercase();
        if EDITABLE_FIELDS.contains(&name.as_str()) {
            columns.push(Some(name));
        } else {
            warnings.push(json!({
                "line": 1,
                "code": "unknown_column",
                "message": format!("column '{}' is not an importable field", cell.trim()),
            }));
            columns.push(None);
        }
    }
    for required in ["nisn", "nama"] {
        if !columns.iter().any(|c| c.as_deref() == Some(required)) {
            return Err(format!("roster header is missing the {} column", required));
        }
    }

    let mut rows = Vec::new();
    let mut rows_total = 0usize;
    for (idx, raw) in lines {
        if raw.trim().is_empty() {
            continue;
        }
        rows_total += 1;
        let line_no = idx + 1;
        let cells = parse_csv_record(raw);

        let mut fields: Vec<(String, String)> = Vec::new();
        for (col, cell) in cells.iter().enumerate() {
            let Some(Some(name)) = columns.get(col) else {
                continue;
            };
            let v = cell.trim();
            if !v.is_empty() {
                fields.push((name.clone(), v.to_string()));
            }
        }

        let row = RosterRow { line_no, fields };
        if row.value("nisn").is_none() {
            warnings.push(json!({
                "line": line_no,
                "code": "missing_nisn",
                "message": "row has no NISN and was skipped",
            }));
            continue;
        }
        if row.value("nama").is_none() {
            warnings.push(json!({
                "line": line_no,
                "code": "missing_name",
                "message": "row has no name and was skipped",
            }));
            continue;
        }
        rows.push(row);
    }

    Ok(RosterParse {
        rows,
        warnings,
        rows_total,
    })
}

/// Minimal quoted-field CSV record parser: doubled quotes inside a quoted
/// cell escape a literal quote, commas inside quotes do not split.
pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                chars.next();
                buf.push('"');
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(std::mem::take(&mut buf));
            }
            _ => buf.push(ch),
        }
    }
    out.push(buf);
    out
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
