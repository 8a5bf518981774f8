//! Output formatting for the shopsync CLI
//!
//! Every formatter renders either a comfy-table for humans or pretty JSON.

use anyhow::{bail, Result};
use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use serde_json::{json, Value};
use shopsync_core::{BatchResult, CacheStats, ChannelEvent, PushEvent};
use shopsync_types::NotificationSnapshot;

/// Parse a `name=value` query parameter
pub fn parse_param(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => bail!("Invalid parameter '{}' (expected: name=value)", raw),
    }
}

fn header(table: &mut Table, columns: &[&str], no_color: bool) {
    if no_color {
        table.set_header(columns.to_vec());
    } else {
        table.set_header(
            columns
                .iter()
                .map(|c| Cell::new(c).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    }
}

/// Notification list with read state
pub fn format_notifications(snapshot: &NotificationSnapshot, json: bool, no_color: bool) -> String {
    if json {
        return serde_json::to_string_pretty(snapshot).unwrap_or_else(|_| "{}".to_string());
    }

    if snapshot.is_empty() {
        return "No notifications.".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    header(&mut table, &["", "ID", "Type", "Date", "Title"], no_color);

    for view in &snapshot.visible {
        let marker = if view.is_read { " " } else { "*" };
        let date = view.item.created_at.format("%Y-%m-%d %H:%M").to_string();
        table.add_row(Row::from(vec![
            marker,
            view.id(),
            &view.item.kind,
            &date,
            &truncate(&view.item.title, 50),
        ]));
    }

    format!("{}\n{} unread", table, snapshot.unread_count)
}

/// Per-request outcome of a batch, in request order
pub fn format_batch(targets: &[String], results: &[BatchResult], json: bool, no_color: bool) -> String {
    if json {
        let rows: Vec<Value> = targets
            .iter()
            .zip(results)
            .map(|(target, result)| {
                json!({
                    "target": target,
                    "success": result.success,
                    "data": result.data.as_deref(),
                    "error": result.error.as_ref().map(|e| e.to_string()),
                })
            })
            .collect();
        return serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    header(&mut table, &["#", "Target", "Status", "Detail"], no_color);

    for (index, (target, result)) in targets.iter().zip(results).enumerate() {
        let (status, detail) = match (&result.data, &result.error) {
            (Some(data), _) => ("ok", truncate(&data.to_string(), 60)),
            (None, Some(error)) => ("failed", error.to_string()),
            (None, None) => ("failed", "-".to_string()),
        };
        let status_cell = if no_color {
            Cell::new(status)
        } else if result.success {
            Cell::new(status).fg(Color::Green)
        } else {
            Cell::new(status).fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(index),
            Cell::new(target),
            status_cell,
            Cell::new(detail),
        ]);
    }

    table.to_string()
}

pub fn format_cache_stats(stats: &CacheStats) -> String {
    let mut lines = vec![
        format!("Entries:      {}/{}", stats.entries, stats.max_entries),
        format!("Hits:         {}", stats.hits),
        format!("Misses:       {}", stats.misses),
        format!("Hit rate:     {:.1}%", stats.hit_rate() * 100.0),
        format!("Evictions:    {}", stats.evictions),
        format!("Expirations:  {}", stats.expirations),
    ];
    for (class, count) in &stats.by_class {
        lines.push(format!("  {:<11} {}", class, count));
    }
    lines.join("\n")
}

/// One line per channel event, for `watch`
pub fn describe_event(event: &ChannelEvent) -> String {
    match event {
        ChannelEvent::StateChanged(state) => format!("state      {}", state.label()),
        ChannelEvent::Connected {
            generation,
            identity,
        } => format!(
            "connected  session #{} as {}",
            generation,
            identity.as_deref().unwrap_or("anonymous")
        ),
        ChannelEvent::Disconnected { generation, reason } => {
            format!("closed     session #{}: {}", generation, reason)
        }
        ChannelEvent::Error { message } => format!("error      {}", message),
        ChannelEvent::Push(delivery) => {
            let room = delivery
                .room
                .as_deref()
                .map(|r| format!(" [{}]", r))
                .unwrap_or_default();
            format!("{:<10} {}{}", "push", describe_push(&delivery.event), room)
        }
    }
}

fn describe_push(event: &PushEvent) -> String {
    match event {
        PushEvent::NotificationCreated(item) => format!("{}: {} ({})", event.name(), item.title, item.id),
        PushEvent::NotificationsChanged => event.name().to_string(),
        PushEvent::MessageCreated {
            conversation_id,
            message,
        } => format!(
            "{}: {} in {}: {}",
            event.name(),
            message.sender_name,
            conversation_id,
            truncate(&message.content, 60)
        ),
        PushEvent::TicketUpdated { ticket_id, status } => {
            format!("{}: {} -> {}", event.name(), ticket_id, status)
        }
        PushEvent::CatalogChanged { scope } => format!("{}: {}", event.name(), scope),
    }
}

/// Truncate to `max` characters, appending an ellipsis
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
