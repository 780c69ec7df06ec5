//! CSV encoding of records for Bulk API uploads.
//!
//! Records are flattened into a [`CsvTable`] (nested maps become dotted column names such
//! as `Account.ExternalId__c`) and the table is cut into upload pages by [`CsvPager`].
//! Every page repeats the header and stays within the byte budget unless a single row
//! is larger than the budget on its own.

use super::ingest::{ColumnDelimiter, Error, LineEnding};
use crate::sobjects::Record;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Flattens one record map into `(column, value)` pairs.
///
/// The `attributes` entry added by the REST API is skipped and `null` becomes an empty
/// cell.
///
/// # Errors
///
/// Returns [`Error::UnsupportedValue`] for array values, which have no CSV form.
pub fn flatten(map: &Map<String, Value>) -> Result<Vec<(String, String)>, Error> {
    let mut cells = Vec::with_capacity(map.len());
    flatten_into("", map, &mut cells)?;
    Ok(cells)
}

fn flatten_into(
    prefix: &str,
    map: &Map<String, Value>,
    cells: &mut Vec<(String, String)>,
) -> Result<(), Error> {
    for (key, value) in map {
        if key == "attributes" {
            continue;
        }
        let column = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(nested) => flatten_into(&column, nested, cells)?,
            Value::Array(_) => return Err(Error::UnsupportedValue { column }),
            Value::Null => cells.push((column, String::new())),
            Value::String(text) => cells.push((column, text.clone())),
            Value::Bool(_) | Value::Number(_) => cells.push((column, value.to_string())),
        }
    }
    Ok(())
}

/// Rows with a shared header, ready to be paged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    /// Builds a table from records.
    ///
    /// Columns appear in first-seen order; a record without a column gets an empty cell.
    /// With `id_only` the table holds just the `Id` column, as delete jobs require.
    pub fn from_records<R: Record>(records: &[R], id_only: bool) -> Result<Self, Error> {
        if id_only {
            let rows: Vec<Vec<String>> = records
                .iter()
                .enumerate()
                .map(|(position, record)| {
                    record.id().map(|id| vec![id]).ok_or_else(|| Error::Planning {
                        source: crate::sobjects::Error::MissingId {
                            position,
                            sobject_type: record.sobject_type().to_string(),
                        },
                    })
                })
                .collect::<Result<_, Error>>()?;
            return Ok(Self {
                columns: vec!["Id".to_string()],
                rows,
            });
        }

        let flattened = records
            .iter()
            .map(|record| flatten(&record.to_map()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for (column, _) in flattened.iter().flatten() {
            if seen.insert(column.as_str()) {
                columns.push(column.clone());
            }
        }

        let rows = flattened
            .into_iter()
            .map(|cells| {
                let mut row = vec![String::new(); columns.len()];
                for (column, value) in cells {
                    if let Some(index) = columns.iter().position(|c| *c == column) {
                        row[index] = value;
                    }
                }
                row
            })
            .collect();

        Ok(Self { columns, rows })
    }
}

/// Cuts a [`CsvTable`] into pages of at most `budget` bytes.
#[derive(Debug, Clone, Copy)]
pub struct CsvPager {
    budget: usize,
    delimiter: ColumnDelimiter,
    line_ending: LineEnding,
}

impl Default for CsvPager {
    fn default() -> Self {
        Self::new(crate::DEFAULT_BULK_PAGE_BYTES)
    }
}

impl CsvPager {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            delimiter: ColumnDelimiter::default(),
            line_ending: LineEnding::default(),
        }
    }

    pub fn with_delimiter(mut self, delimiter: ColumnDelimiter) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Encodes the table into pages, each starting with the header row.
    ///
    /// Rows are appended to the current page until one would push it past the budget;
    /// the page is then rolled back to before that row and emitted, and the row opens the
    /// next page. A row that does not fit even on an empty page is emitted alone.
    pub fn paginate(&self, table: &CsvTable) -> Result<Vec<Vec<u8>>, Error> {
        let header = self.encode(&table.columns)?;
        let mut pages = Vec::new();
        let mut page = header.clone();
        let mut rows_in_page = 0usize;

        for row in &table.rows {
            let encoded = self.encode(row)?;
            let before_row = page.len();
            page.extend_from_slice(&encoded);

            if page.len() > self.budget && rows_in_page > 0 {
                page.truncate(before_row);
                pages.push(std::mem::replace(&mut page, header.clone()));
                page.extend_from_slice(&encoded);
                rows_in_page = 0;
            }
            rows_in_page += 1;

            if rows_in_page == 1 && page.len() > self.budget {
                tracing::warn!(
                    bytes = page.len(),
                    budget = self.budget,
                    "csv row exceeds the page budget, uploading it alone"
                );
            }
        }

        if rows_in_page > 0 {
            pages.push(page);
        }
        tracing::debug!(
            rows = table.rows.len(),
            pages = pages.len(),
            "encoded csv pages"
        );
        Ok(pages)
    }

    fn encode(&self, fields: &[String]) -> Result<Vec<u8>, Error> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter.as_byte())
            .terminator(self.line_ending.terminator())
            .from_writer(Vec::new());
        writer
            .write_record(fields)
            .map_err(|source| Error::Csv { source })?;
        writer.into_inner().map_err(|error| Error::Csv {
            source: csv::Error::from(error.into_error()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sobjects::SObject;
    use serde_json::json;

    fn table(rows: &[&str]) -> CsvTable {
        CsvTable {
            columns: vec!["Name".to_string()],
            rows: rows.iter().map(|r| vec![r.to_string()]).collect(),
        }
    }

    #[test]
    fn test_flatten_nested_maps() {
        let map = json!({
            "attributes": {"type": "Contact"},
            "LastName": "Doe",
            "Age": 42,
            "Active": true,
            "Phone": null,
            "Account": {"ExternalId__c": "A-1", "Owner": {"Email": "o@example.com"}}
        });
        let cells = flatten(map.as_object().unwrap()).unwrap();
        assert_eq!(
            cells,
            vec![
                ("Account.ExternalId__c".to_string(), "A-1".to_string()),
                ("Account.Owner.Email".to_string(), "o@example.com".to_string()),
                ("Active".to_string(), "true".to_string()),
                ("Age".to_string(), "42".to_string()),
                ("LastName".to_string(), "Doe".to_string()),
                ("Phone".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_flatten_rejects_arrays() {
        let map = json!({"Tags": ["a", "b"]});
        assert!(matches!(
            flatten(map.as_object().unwrap()),
            Err(Error::UnsupportedValue { column }) if column == "Tags"
        ));
    }

    #[test]
    fn test_table_fills_missing_columns() {
        let records = vec![
            SObject::new("Account").with("Name", "Acme"),
            SObject::new("Account").with("Phone", "555"),
        ];
        let table = CsvTable::from_records(&records, false).unwrap();
        assert_eq!(table.columns, vec!["Name", "Phone"]);
        assert_eq!(
            table.rows,
            vec![
                vec!["Acme".to_string(), String::new()],
                vec![String::new(), "555".to_string()],
            ]
        );
    }

    #[test]
    fn test_table_id_only() {
        let records = vec![
            SObject::new("Account").with("Id", "001A").with("Name", "Acme"),
            SObject::new("Account").with("Id", "001B"),
        ];
        let table = CsvTable::from_records(&records, true).unwrap();
        assert_eq!(table.columns, vec!["Id"]);
        assert_eq!(table.rows, vec![vec!["001A"], vec!["001B"]]);

        let missing = vec![SObject::new("Account")];
        assert!(matches!(
            CsvTable::from_records(&missing, true),
            Err(Error::Planning { .. })
        ));
    }

    #[test]
    fn test_single_page() {
        let pages = CsvPager::default()
            .paginate(&table(&["Acme", "Globex, Inc."]))
            .unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(
            String::from_utf8(pages[0].clone()).unwrap(),
            "Name\nAcme\n\"Globex, Inc.\"\n"
        );
    }

    #[test]
    fn test_rollback_at_budget_edge() {
        // Header and each row are 5 bytes: two rows fill a 15 byte page exactly.
        let pages = CsvPager::new(15)
            .paginate(&table(&["aaaa", "bbbb", "cccc"]))
            .unwrap();
        let pages: Vec<_> = pages
            .into_iter()
            .map(|p| String::from_utf8(p).unwrap())
            .collect();
        assert_eq!(pages, vec!["Name\naaaa\nbbbb\n", "Name\ncccc\n"]);
    }

    #[test]
    fn test_pages_within_budget() {
        let rows: Vec<String> = (0..500).map(|i| format!("record-{i}")).collect();
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let pages = CsvPager::new(256).paginate(&table(&refs)).unwrap();

        assert!(pages.len() > 1);
        assert!(pages.iter().all(|p| p.len() <= 256));
        assert!(pages.iter().all(|p| p.starts_with(b"Name\n")));
        let total_rows: usize = pages
            .iter()
            .map(|p| p.iter().filter(|b| **b == b'\n').count() - 1)
            .sum();
        assert_eq!(total_rows, 500);
    }

    #[test]
    fn test_oversized_row_emitted_alone() {
        let pages = CsvPager::new(8)
            .paginate(&table(&["ab", "much-too-long", "cd"]))
            .unwrap();
        let pages: Vec<_> = pages
            .into_iter()
            .map(|p| String::from_utf8(p).unwrap())
            .collect();
        assert_eq!(
            pages,
            vec!["Name\nab\n", "Name\nmuch-too-long\n", "Name\ncd\n"]
        );
    }

    #[test]
    fn test_delimiter_and_line_ending() {
        let table = CsvTable {
            columns: vec!["Name".to_string(), "Phone".to_string()],
            rows: vec![vec!["Acme".to_string(), "555".to_string()]],
        };
        let pages = CsvPager::default()
            .with_delimiter(ColumnDelimiter::Pipe)
            .with_line_ending(LineEnding::Crlf)
            .paginate(&table)
            .unwrap();
        assert_eq!(pages[0], b"Name|Phone\r\nAcme|555\r\n");
    }

    #[test]
    fn test_empty_table_has_no_pages() {
        assert!(CsvPager::default().paginate(&table(&[])).unwrap().is_empty());
    }
}
