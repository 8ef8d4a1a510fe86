/// Table formatting for queue contents using comfy-table

use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use reclaim_sync::{DeadLetter, QueueItem, SyncStats};

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Format active queue items, oldest first
pub fn format_items_table(items: &[QueueItem]) -> String {
    if items.is_empty() {
        return "Queue is empty".to_string();
    }

    let mut table = new_table();
    table.set_header(vec!["id", "kind", "status", "attempts", "key", "created", "last error"]);

    for item in items {
        table.add_row(vec![
            Cell::new(item.id),
            Cell::new(item.operation_type()),
            Cell::new(item.status),
            Cell::new(item.attempts),
            Cell::new(&item.idempotency_key),
            Cell::new(item.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(item.last_error.as_deref().unwrap_or("-")),
        ]);
    }

    table.to_string()
}

/// Format the dead set
pub fn format_dead_table(letters: &[DeadLetter]) -> String {
    if letters.is_empty() {
        return "No dead items".to_string();
    }

    let mut table = new_table();
    table.set_header(vec!["id", "kind", "reason", "attempts", "retired", "error"]);

    for letter in letters {
        table.add_row(vec![
            Cell::new(letter.item.id),
            Cell::new(letter.item.operation_type()),
            Cell::new(letter.reason),
            Cell::new(letter.item.attempts),
            Cell::new(letter.retired_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&letter.error),
        ]);
    }

    table.to_string()
}

pub fn format_stats_table(stats: &SyncStats) -> String {
    let mut table = new_table();
    table.set_header(vec!["pending", "processing", "failed", "total", "dead"]);
    table.add_row(vec![
        Cell::new(stats.pending),
        Cell::new(stats.processing),
        Cell::new(stats.failed),
        Cell::new(stats.total),
        Cell::new(stats.dead),
    ]);
    table.to_string()
}
