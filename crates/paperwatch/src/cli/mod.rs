//! Command implementations and shared terminal output helpers

pub mod scan;
pub mod status;

use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};

/// Print a table with headers and rows
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    for row in rows {
        table.add_row(row);
    }
    println!("{}", table);
}

/// Local wall-clock rendering of a Unix-millisecond timestamp
pub fn format_millis(millis: i64) -> String {
    use chrono::{DateTime, Local};

    let datetime: DateTime<Local> = paperwatch_db::StateDb::millis_to_datetime(millis).into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// "in 42s", "3m ago", ...
pub fn format_relative(millis: i64, now: i64) -> String {
    let delta = (millis - now) / 1000;
    let magnitude = delta.unsigned_abs();
    let text = if magnitude < 60 {
        format!("{}s", magnitude)
    } else if magnitude < 3600 {
        format!("{}m", magnitude / 60)
    } else if magnitude < 86_400 {
        format!("{}h", magnitude / 3600)
    } else {
        format!("{}d", magnitude / 86_400)
    };
    if delta >= 0 {
        format!("in {}", text)
    } else {
        format!("{} ago", text)
    }
}
