//! Text rendering of query results.
//!
//! Tabular rows render as a markdown table, graph rows as pretty-printed
//! JSON. Both show at most `limit` rows and note how many were omitted.

use serde_json::Value;

use crate::models::{Row, ToolName};

/// Cells longer than this are truncated with an ellipsis.
const MAX_CELL_WIDTH: usize = 64;

pub fn render_rows(tool: ToolName, rows: &[Row], limit: usize) -> String {
    match tool {
        ToolName::Graph => json_dump(rows, limit),
        _ => markdown_table(rows, limit),
    }
}

/// Markdown table of the first `limit` rows. Columns follow first-seen
/// order across the shown rows.
pub fn markdown_table(rows: &[Row], limit: usize) -> String {
    if rows.is_empty() {
        return String::new();
    }
    let shown = &rows[..rows.len().min(limit)];

    let mut columns: Vec<&str> = Vec::new();
    for row in shown {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let mut out = String::new();
    let header: Vec<String> = columns.iter().map(|c| escape(c)).collect();
    out.push_str(&format!("| {} |\n", header.join(" | ")));
    out.push_str(&format!("|{}\n", " --- |".repeat(columns.len())));
    for row in shown {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| row.get(*c).map(cell_text).unwrap_or_default())
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }

    out.push_str(&omitted_note(rows.len(), shown.len()));
    out
}

/// Pretty JSON array of the first `limit` rows.
pub fn json_dump(rows: &[Row], limit: usize) -> String {
    if rows.is_empty() {
        return String::new();
    }
    let shown = &rows[..rows.len().min(limit)];
    let mut out = serde_json::to_string_pretty(shown).unwrap_or_else(|_| "[]".to_string());
    out.push('\n');
    out.push_str(&omitted_note(rows.len(), shown.len()));
    out
}

fn omitted_note(total: usize, shown: usize) -> String {
    if total > shown {
        format!("\n_Showing {} of {} rows._\n", shown, total)
    } else {
        String::new()
    }
}

fn cell_text(value: &Value) -> String {
    let text = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    escape(&truncate(&text))
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_CELL_WIDTH {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(MAX_CELL_WIDTH - 3).collect::<String>())
    }
}

fn escape(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}
