use crate::database::QueryResult;
use crate::history::{HistoryEntry, HistoryStats};
use crate::nl_sql::schema::TableSchema;
use prettytable::{Cell, Row, Table};

fn display_width(text: &str) -> usize {
    text.chars().count()
}

fn pad(text: &str, width: usize, left_align: bool) -> String {
    let len = display_width(text);
    if len >= width {
        return text.to_string();
    }
    let padding = " ".repeat(width - len);
    if left_align {
        format!("{text}{padding}")
    } else {
        format!("{padding}{text}")
    }
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-' || c == '+')
}

/// psql-style grid: left-aligned header, numbers right-aligned, row count footer
pub fn format_query_result_psql(result: &QueryResult) -> String {
    if result.columns.is_empty() {
        return String::new();
    }

    let mut widths: Vec<usize> = result.columns.iter().map(|c| display_width(c)).collect();
    for row in &result.rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(display_width(cell));
        }
    }

    let mut out = String::new();
    let header: Vec<String> = result
        .columns
        .iter()
        .zip(&widths)
        .map(|(h, w)| pad(h, *w, true))
        .collect();
    out.push_str(header.join(" | ").trim_end());
    out.push('\n');

    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&separator.join("-+-"));
    out.push('\n');

    for row in &result.rows {
        let cells: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let value = row.get(i).map(String::as_str).unwrap_or("");
                pad(value, *w, !is_numeric(value))
            })
            .collect();
        // Left-aligned last cells carry no trailing padding
        out.push_str(cells.join(" | ").trim_end());
        out.push('\n');
    }

    let count = result.row_count();
    out.push_str(&format!(
        "({} {})\n",
        count,
        if count == 1 { "row" } else { "rows" }
    ));
    out
}

/// One two-column table per record
pub fn format_query_result_expanded(result: &QueryResult) -> Vec<Table> {
    result
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut table = Table::new();
            table.add_row(Row::new(vec![
                Cell::new(&format!("Record {}", i + 1)),
                Cell::new(""),
            ]));
            for (column, value) in result.columns.iter().zip(row) {
                table.add_row(Row::new(vec![Cell::new(column), Cell::new(value)]));
            }
            table
        })
        .collect()
}

/// `Table "name"` header followed by Column / Type / Modifiers
pub fn format_table_schema(table: &TableSchema) -> String {
    let rows: Vec<[String; 3]> = table
        .columns
        .iter()
        .map(|c| {
            let mut modifiers = Vec::new();
            if c.is_primary_key {
                modifiers.push("PRIMARY KEY");
            }
            if !c.nullable {
                modifiers.push("NOT NULL");
            }
            let modifiers = if modifiers.is_empty() {
                "-".to_string()
            } else {
                modifiers.join(", ")
            };
            [c.name.clone(), c.data_type.clone(), modifiers]
        })
        .collect();

    let mut widths = [
        display_width("Column"),
        display_width("Type"),
        display_width("Modifiers"),
    ];
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(display_width(cell));
        }
    }

    let mut out = format!("Table \"{}\"", table.name);
    if let Some(count) = table.row_count {
        out.push_str(&format!(" ({count} rows)"));
    }
    out.push('\n');
    out.push_str(&format!(
        "{} | {} | {}\n",
        pad("Column", widths[0], true),
        pad("Type", widths[1], true),
        pad("Modifiers", widths[2], true)
    ));
    out.push_str(&format!(
        "{}-+-{}-+-{}\n",
        "-".repeat(widths[0]),
        "-".repeat(widths[1]),
        "-".repeat(widths[2])
    ));
    for [name, data_type, modifiers] in &rows {
        out.push_str(&format!(
            "{} | {} | {}\n",
            pad(name, widths[0], true),
            pad(data_type, widths[1], true),
            pad(modifiers, widths[2], true)
        ));
    }
    out
}

pub fn format_history(entries: &[HistoryEntry]) -> Table {
    let mut table = Table::new();
    table.set_titles(Row::new(
        ["ID", "Time", "OK", "Mode", "Rows", "ms", "Question"]
            .iter()
            .map(|h| Cell::new(h))
            .collect(),
    ));
    for e in entries {
        table.add_row(Row::new(vec![
            Cell::new(&e.id.to_string()),
            Cell::new(&e.timestamp.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(if e.success { "yes" } else { "no" }),
            Cell::new(&e.llm_mode),
            Cell::new(&e.rows_returned.to_string()),
            Cell::new(&e.execution_time_ms.to_string()),
            Cell::new(&truncate(&e.question, 60)),
        ]));
    }
    table
}

pub fn format_history_stats(stats: &HistoryStats) -> String {
    let mut out = String::new();
    out.push_str(&format!("Total queries:      {}\n", stats.total_queries));
    out.push_str(&format!("Successful:         {}\n", stats.successful_queries));
    out.push_str(&format!("Success rate:       {:.1}%\n", stats.success_rate));
    out.push_str(&format!("Avg execution time: {:.1} ms\n", stats.avg_execution_time_ms));
    out.push_str(&format!("Total tokens:       {}\n", stats.total_tokens));
    if !stats.llm_modes.is_empty() {
        let modes: Vec<String> = stats
            .llm_modes
            .iter()
            .map(|(mode, n)| format!("{mode}={n}"))
            .collect();
        out.push_str(&format!("LLM modes:          {}\n", modes.join(", ")));
    }
    out
}

fn truncate(text: &str, max_chars: usize) -> String {
    if display_width(text) <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nl_sql::schema::SchemaColumn;

    fn result() -> QueryResult {
        QueryResult {
            columns: vec!["gender".into(), "patient_count".into()],
            rows: vec![vec!["F".into(), "3".into()], vec!["M".into(), "2".into()]],
        }
    }

    #[test]
    fn test_psql_layout() {
        let text = format_query_result_psql(&result());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "gender | patient_count");
        assert_eq!(lines[1], "-------+--------------");
        assert_eq!(lines[2], "F      |             3");
        assert_eq!(lines[4], "(2 rows)");
    }

    #[test]
    fn test_psql_handles_multibyte_and_short_rows() {
        let text = format_query_result_psql(&QueryResult {
            columns: vec!["şehir".into(), "n".into()],
            rows: vec![vec!["İstanbul".into()]],
        });
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "şehir    | n");
        assert_eq!(lines[2], "İstanbul |");
        assert_eq!(lines[3], "(1 row)");
        assert!(format_query_result_psql(&QueryResult::default()).is_empty());
    }

    #[test]
    fn test_psql_rows_have_no_trailing_padding() {
        let text = format_query_result_psql(&QueryResult {
            columns: vec!["n".into(), "gender".into()],
            rows: vec![vec!["10".into(), "F".into()], vec!["7".into(), "".into()]],
        });
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "n  | gender");
        assert_eq!(lines[2], "10 | F");
        assert_eq!(lines[3], " 7 |");
        assert!(text.lines().all(|l| !l.ends_with(' ')));
    }

    #[test]
    fn test_expanded_tables_per_record() {
        let tables = format_query_result_expanded(&result());
        assert_eq!(tables.len(), 2);
        assert!(tables[1].to_string().contains("Record 2"));
    }

    #[test]
    fn test_table_schema_modifiers() {
        let table = TableSchema {
            name: "json_patients".into(),
            columns: vec![
                SchemaColumn {
                    name: "subject_id".into(),
                    data_type: "INTEGER".into(),
                    is_primary_key: true,
                    nullable: false,
                },
                SchemaColumn {
                    name: "gender".into(),
                    data_type: "TEXT".into(),
                    is_primary_key: false,
                    nullable: true,
                },
            ],
            row_count: Some(5),
        };
        let text = format_table_schema(&table);
        assert!(text.starts_with("Table \"json_patients\" (5 rows)\n"));
        assert!(text.contains("subject_id | INTEGER | PRIMARY KEY, NOT NULL"));
        assert!(text.contains("gender     | TEXT    | -"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ççççççççççç", 6), "ççç...");
    }
}
