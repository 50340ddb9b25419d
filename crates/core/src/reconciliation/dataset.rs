//! Uploaded tabular datasets
//!
//! Comma-delimited UTF-8 with a header row. Quoted fields may contain
//! commas, doubled quotes and line breaks. A leading BOM and CRLF line
//! endings are accepted.

use serde_json::{Map, Value};
use tillsync_domain::{Result, TillSyncError};

/// One data row keyed by header name. `line` is the 1-based line the row
/// starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    pub line: usize,
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub headers: Vec<String>,
    pub rows: Vec<DatasetRow>,
    /// Rows dropped because their column count did not match the header.
    pub malformed_rows: Vec<usize>,
}

impl Dataset {
    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }
}

/// Parse raw upload bytes. Fails on invalid UTF-8, a missing or invalid
/// header row, or an unterminated quote; ragged data rows are skipped and
/// reported in [`Dataset::malformed_rows`].
pub fn parse_csv(bytes: &[u8]) -> Result<Dataset> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| TillSyncError::InvalidInput(format!("dataset is not valid UTF-8: {e}")))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut records = split_records(text)?.into_iter();
    let (_, header) = records
        .next()
        .ok_or_else(|| TillSyncError::InvalidInput("dataset is empty".into()))?;
    let headers: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();
    validate_headers(&headers)?;

    let mut dataset = Dataset { headers, ..Default::default() };
    for (line, fields) in records {
        if fields.len() != dataset.headers.len() {
            dataset.malformed_rows.push(line);
            continue;
        }
        let values = dataset
            .headers
            .iter()
            .cloned()
            .zip(fields.into_iter().map(Value::String))
            .collect();
        dataset.rows.push(DatasetRow { line, values });
    }
    Ok(dataset)
}

fn validate_headers(headers: &[String]) -> Result<()> {
    if headers.iter().any(String::is_empty) {
        return Err(TillSyncError::InvalidInput("dataset header has an empty column name".into()));
    }
    for (i, name) in headers.iter().enumerate() {
        if headers[..i].contains(name) {
            return Err(TillSyncError::InvalidInput(format!("duplicate column {name:?}")));
        }
    }
    Ok(())
}

/// Split into `(start_line, fields)` records, dropping blank lines.
fn split_records(text: &str) -> Result<Vec<(usize, Vec<String>)>> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push('\n');
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                push_record(&mut records, record_line, std::mem::take(&mut fields));
                line += 1;
                record_line = line;
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(TillSyncError::InvalidInput(format!(
            "unterminated quoted field starting on line {record_line}"
        )));
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        push_record(&mut records, record_line, fields);
    }
    Ok(records)
}

fn push_record(records: &mut Vec<(usize, Vec<String>)>, line: usize, fields: Vec<String>) {
    let blank = fields.len() == 1 && fields[0].trim().is_empty();
    if !blank {
        records.push((line, fields));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_and_rows() {
        let dataset = parse_csv(b"sku,stock\nA-1,10\nA-2,7\n").unwrap();
        assert_eq!(dataset.headers, vec!["sku", "stock"]);
        assert_eq!(dataset.rows.len(), 2);
        assert_eq!(dataset.rows[1].values["stock"], "7");
        assert_eq!(dataset.rows[1].line, 3);
    }

    #[test]
    fn handles_quotes_bom_and_crlf() {
        let input = "\u{feff}sku,name\r\n\"A-1\",\"Widget, large\"\r\nA-2,\"say \"\"hi\"\"\"\r\n";
        let dataset = parse_csv(input.as_bytes()).unwrap();
        assert_eq!(dataset.headers, vec!["sku", "name"]);
        assert_eq!(dataset.rows[0].values["name"], "Widget, large");
        assert_eq!(dataset.rows[1].values["name"], "say \"hi\"");
    }

    #[test]
    fn quoted_newlines_stay_in_the_field() {
        let dataset = parse_csv(b"sku,note\nA-1,\"two\nlines\"\nA-2,x").unwrap();
        assert_eq!(dataset.rows[0].values["note"], "two\nlines");
        assert_eq!(dataset.rows[1].line, 4);
    }

    #[test]
    fn ragged_rows_are_reported_not_fatal() {
        let dataset = parse_csv(b"sku,stock\nA-1,10\nA-2\n\nA-3,1,extra\nA-4,4").unwrap();
        assert_eq!(dataset.rows.len(), 2);
        assert_eq!(dataset.malformed_rows, vec![3, 5]);
    }

    #[test]
    fn rejects_unreadable_input() {
        assert!(parse_csv(b"").is_err());
        assert!(parse_csv(&[0xff, 0xfe, 0x00]).is_err());
        assert!(parse_csv(b"sku,sku\n1,2").is_err());
        assert!(parse_csv(b"sku,\n1,2").is_err());
        assert!(parse_csv(b"sku,name\nA-1,\"open").is_err());
    }
}
