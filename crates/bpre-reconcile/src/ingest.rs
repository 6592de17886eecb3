//! Schema-less tabular upload parsing.
//!
//! Accepts comma, semicolon or tab separated text with or without a header
//! row and reduces it to the distinct phone keys it mentions. Column choice is
//! a best-effort lookup that falls back to the first column, never an error.

use std::collections::HashSet;

use bpre_core::PhoneKey;
use serde::Serialize;

use crate::ReconcileError;

/// Header names (lower-cased, whitespace removed) that mark the phone column.
pub const PHONE_HEADER_ALIASES: [&str; 5] = ["phone", "phonenumber", "number", "telefono", "tel"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    Comma,
    Semicolon,
    Tab,
}

impl Delimiter {
    pub fn as_char(self) -> char {
        match self {
            Delimiter::Comma => ',',
            Delimiter::Semicolon => ';',
            Delimiter::Tab => '\t',
        }
    }
}

/// Tab wins whenever it occurs and is not outnumbered, then semicolon, then
/// comma as the default.
pub fn detect_delimiter(first_line: &str) -> Delimiter {
    let count = |c: char| first_line.chars().filter(|&x| x == c).count();
    let (commas, semicolons, tabs) = (count(','), count(';'), count('\t'));

    if tabs > 0 && tabs >= commas && tabs >= semicolons {
        Delimiter::Tab
    } else if semicolons > 0 && semicolons >= commas {
        Delimiter::Semicolon
    } else {
        Delimiter::Comma
    }
}

/// Split one line into cells. A `"` toggles quoting and is dropped from the
/// output; the delimiter does not split while quoted.
pub fn split_row(line: &str, delimiter: Delimiter) -> Vec<String> {
    let delimiter = delimiter.as_char();
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for ch in line.chars() {
        if ch == '"' {
            quoted = !quoted;
        } else if ch == delimiter && !quoted {
            cells.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }
    cells.push(current.trim().to_string());
    cells
}

fn is_header_row(row: &[String]) -> bool {
    row.iter().any(|cell| cell.chars().any(char::is_alphabetic))
}

fn phone_column(header: &[String]) -> Option<usize> {
    header.iter().position(|cell| {
        let name: String = cell
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        PHONE_HEADER_ALIASES.contains(&name.as_str())
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct IngestResult {
    /// Non-empty trimmed input lines.
    pub raw_lines: Vec<String>,
    /// Distinct keys in first-seen order.
    pub phone_numbers: Vec<PhoneKey>,
    pub delimiter: Option<Delimiter>,
    pub has_header: bool,
    pub phone_column: usize,
    /// Data rows whose selected cell held no digits.
    pub skipped_rows: usize,
}

impl IngestResult {
    /// An upload without a single usable key cannot proceed.
    pub fn require_phones(self) -> Result<Self, ReconcileError> {
        if self.phone_numbers.is_empty() {
            Err(ReconcileError::Parse)
        } else {
            Ok(self)
        }
    }
}

pub fn parse(raw_text: &str) -> IngestResult {
    let raw_lines: Vec<String> = raw_text
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    let Some(first_line) = raw_lines.first() else {
        return IngestResult::default();
    };

    let delimiter = detect_delimiter(first_line);
    let rows: Vec<Vec<String>> = raw_lines
        .iter()
        .map(|line| split_row(line, delimiter))
        .collect();

    let has_header = is_header_row(&rows[0]);
    let (data_start, column) = if has_header {
        (1, phone_column(&rows[0]).unwrap_or(0))
    } else {
        (0, 0)
    };

    let mut seen = HashSet::new();
    let mut phone_numbers = Vec::new();
    let mut skipped_rows = 0usize;

    for row in rows.iter().skip(data_start) {
        let cell = row.get(column).or_else(|| row.first());
        let key = cell.map(|c| PhoneKey::normalize(c)).unwrap_or_default();
        if key.is_empty() {
            skipped_rows += 1;
            continue;
        }
        if seen.insert(key.clone()) {
            phone_numbers.push(key);
        }
    }

    IngestResult {
        raw_lines,
        phone_numbers,
        delimiter: Some(delimiter),
        has_header,
        phone_column: column,
        skipped_rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(result: &IngestResult) -> Vec<&str> {
        result.phone_numbers.iter().map(|k| k.as_str()).collect()
    }

    #[test]
    fn tab_wins_three_way_tie() {
        assert_eq!(detect_delimiter("a,b;c\td"), Delimiter::Tab);
    }

    #[test]
    fn delimiter_detection_by_count() {
        assert_eq!(detect_delimiter("name;phone;email"), Delimiter::Semicolon);
        assert_eq!(detect_delimiter("name,phone;x,y"), Delimiter::Comma);
        assert_eq!(detect_delimiter("a;b,c"), Delimiter::Semicolon);
        assert_eq!(detect_delimiter("5551234567"), Delimiter::Comma);
        assert_eq!(detect_delimiter("a\tb,c,d"), Delimiter::Comma);
    }

    #[test]
    fn quoted_delimiters_do_not_split() {
        let cells = split_row(r#""Doe, Jane","555-123-4567",x"#, Delimiter::Comma);
        assert_eq!(cells, vec!["Doe, Jane", "555-123-4567", "x"]);
    }

    #[test]
    fn headerless_single_column_upload() {
        let result = parse("5551234567\n(555) 123-4567\r\n\n  15559876543  \r");
        assert!(!result.has_header);
        assert_eq!(keys(&result), vec!["5551234567", "5559876543"]);
        assert_eq!(result.raw_lines.len(), 3);
    }

    #[test]
    fn header_selects_phone_alias_column() {
        let raw = "Name,Email, Phone Number \nAna,ana@example.com,555-000-1111\nLuis,luis@example.com,+1 555 000 2222\n";
        let result = parse(raw);
        assert!(result.has_header);
        assert_eq!(result.phone_column, 2);
        assert_eq!(keys(&result), vec!["5550001111", "5550002222"]);
    }

    #[test]
    fn spanish_alias_and_semicolons() {
        let raw = "nombre;Telefono\n\"Pérez; Ana\";55 1234 5678\nLuis;5512345679";
        let result = parse(raw);
        assert_eq!(result.delimiter, Some(Delimiter::Semicolon));
        assert_eq!(result.phone_column, 1);
        assert_eq!(keys(&result), vec!["5512345678", "5512345679"]);
    }

    #[test]
    fn unknown_header_falls_back_to_first_column() {
        let raw = "mobile,name\n5551112222,Ana\n";
        let result = parse(raw);
        assert!(result.has_header);
        assert_eq!(result.phone_column, 0);
        assert_eq!(keys(&result), vec!["5551112222"]);
    }

    #[test]
    fn short_rows_fall_back_to_first_cell() {
        let raw = "name,phone\n5553334444\nAna,5553335555";
        let result = parse(raw);
        assert_eq!(keys(&result), vec!["5553334444", "5553335555"]);
    }

    #[test]
    fn duplicates_and_empty_cells_are_dropped() {
        let raw = "phone\n555-123-4567\n15551234567\nn/a\n\n5551234567\n5559990000";
        let result = parse(raw);
        assert_eq!(keys(&result), vec!["5551234567", "5559990000"]);
        assert_eq!(result.skipped_rows, 1);

        let unique: HashSet<_> = result.phone_numbers.iter().collect();
        assert_eq!(unique.len(), result.phone_numbers.len());
    }

    #[test]
    fn empty_or_header_only_upload_is_a_parse_error() {
        assert!(matches!(parse("").require_phones(), Err(ReconcileError::Parse)));
        assert!(matches!(parse(" \r\n \n").require_phones(), Err(ReconcileError::Parse)));
        assert!(matches!(
            parse("name,phone\n").require_phones(),
            Err(ReconcileError::Parse)
        ));
        assert!(parse("5551234567").require_phones().is_ok());
    }
}
