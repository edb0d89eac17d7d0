//! Terminal output helpers.

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use ebbflow_protocol::PartitionStatus;

/// Print a table with cyan headers.
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    println!("{}", build_table(headers, rows));
}

fn build_table(headers: &[&str], rows: Vec<Vec<String>>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|h| Cell::new(h).fg(Color::Cyan))
        .collect();
    table.set_header(header_cells);

    for row in rows {
        table.add_row(row);
    }
    table
}

/// Print a table whose cells may carry a color.
pub fn print_table_colored(headers: &[&str], rows: Vec<Vec<(String, Option<Color>)>>) {
    let mut table = build_table(headers, Vec::new());
    for row in rows {
        let cells: Vec<Cell> = row
            .into_iter()
            .map(|(text, color)| match color {
                Some(c) => Cell::new(text).fg(c),
                None => Cell::new(text),
            })
            .collect();
        table.add_row(cells);
    }
    println!("{}", table);
}

pub fn status_color(status: PartitionStatus) -> Option<Color> {
    match status {
        PartitionStatus::Success => Some(Color::Green),
        PartitionStatus::Failed => Some(Color::Red),
        PartitionStatus::Skipped => Some(Color::DarkGrey),
        PartitionStatus::New => None,
    }
}

/// `2024-03-01 06:00:00 UTC`, or `-`.
pub fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
        assert_eq!(format_timestamp(Some(ts)), "2024-03-01 06:00:00 UTC");
        assert_eq!(format_timestamp(None), "-");
    }

    #[test]
    fn test_table_has_every_row() {
        let table = build_table(
            &["Partition", "Status"],
            vec![
                vec!["Sydney".to_string(), "success".to_string()],
                vec!["Perth".to_string(), "skipped".to_string()],
            ],
        );
        assert_eq!(table.row_iter().count(), 2);
        let rendered = table.to_string();
        assert!(rendered.contains("Sydney"));
        assert!(rendered.contains("Perth"));
    }
}
