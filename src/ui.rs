use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap};

use crate::app::{App, InputMode, Overlay, PendingConfirmation};
use crate::model::{OperationKind, ReplicaMember, ServerStatus};

const BG: Color = Color::Rgb(9, 15, 25);
const PANEL: Color = Color::Rgb(16, 27, 44);
const ACCENT: Color = Color::Rgb(52, 211, 153);
const MUTED: Color = Color::Rgb(140, 156, 178);
const WARN: Color = Color::Rgb(251, 191, 36);
const ERROR: Color = Color::Rgb(248, 113, 113);

pub fn render(frame: &mut Frame, app: &mut App) {
    let has_replication =
        !app.snapshot.replica_members.is_empty() || !app.snapshot.replication_info.is_empty();
    let status_height = (app.snapshot.statuses.len() + app.snapshot.faults.len()) as u16 + 3;
    let mut constraints = vec![Constraint::Length(1), Constraint::Length(status_height)];
    if has_replication {
        constraints.push(Constraint::Length(
            (app.snapshot.replica_members.len() + app.snapshot.replication_info.len()) as u16 + 3,
        ));
    }
    constraints.push(Constraint::Min(5));
    constraints.push(Constraint::Length(1));

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(frame.area());

    let mut slot = 0;
    render_header(frame, root[slot], app);
    slot += 1;
    render_status(frame, root[slot], app);
    slot += 1;
    if has_replication {
        render_replication(frame, root[slot], app);
        slot += 1;
    }
    render_operations(frame, root[slot], app);
    slot += 1;
    render_footer(frame, root[slot], app);

    if let Some(overlay) = app.overlay.clone() {
        render_overlay(frame, &overlay);
    } else if app.show_help {
        render_help_modal(frame);
    }
    if let Some(pending) = app.pending_confirmation.clone() {
        render_confirmation(frame, &pending);
    }
    if app.mode == InputMode::Prompt {
        render_prompt(frame, app);
    }
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let mut spans = vec![
        Span::styled(" montop ", Style::default().fg(Color::Black).bg(ACCENT)),
        Span::raw(" "),
        Span::styled(
            format!("{} ops", app.snapshot.operations.len()),
            Style::default().fg(Color::White),
        ),
        Span::raw("  "),
        Span::styled(
            app.snapshot.at.format("%H:%M:%S").to_string(),
            Style::default().fg(MUTED),
        ),
    ];
    if app.paused {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(
            "PAUSED",
            Style::default().fg(WARN).add_modifier(Modifier::BOLD),
        ));
    }
    if !app.snapshot.faults.is_empty() {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(
            format!("{} unreachable", app.snapshot.faults.len()),
            Style::default().fg(ERROR),
        ));
    }
    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

fn render_status(frame: &mut Frame, area: Rect, app: &App) {
    let headers = [
        "Server", "QPS", "Active", "Queued", "Flush/s", "Conns", "ResMB", "NetIn", "NetOut",
        "Fault/s",
    ];
    let header_row = Row::new(headers.iter().map(|header| {
        Cell::from(*header).style(Style::default().add_modifier(Modifier::BOLD))
    }))
    .height(1)
    .style(Style::default().fg(ACCENT));

    let mut rows: Vec<Row> = app.snapshot.statuses.iter().map(status_row).collect();
    for fault in &app.snapshot.faults {
        let style = Style::default().fg(ERROR);
        rows.push(Row::new(vec![
            Cell::from(fault.server.clone()).style(style),
            Cell::from(format!("unreachable: {}", fault.message)).style(style),
        ]));
    }

    let widths = [
        Constraint::Min(12),
        Constraint::Length(8),
        Constraint::Length(7),
        Constraint::Length(7),
        Constraint::Length(8),
        Constraint::Length(11),
        Constraint::Length(7),
        Constraint::Length(8),
        Constraint::Length(8),
        Constraint::Length(8),
    ];
    let table = Table::new(rows, widths)
        .header(header_row)
        .block(panel_block("Status"))
        .column_spacing(1);
    frame.render_widget(table, area);
}

fn status_row(status: &ServerStatus) -> Row<'static> {
    let style = Style::default().fg(Color::White);
    Row::new(vec![
        Cell::from(status.server.clone()).style(style),
        Cell::from(format!("{:.1}", status.queries_per_sec)).style(style),
        Cell::from(status.active_clients.to_string()).style(style),
        Cell::from(status.queued.to_string()).style(style),
        Cell::from(format!("{:.1}", status.flushes_per_sec)).style(style),
        Cell::from(format!(
            "{}/{}",
            status.connections_current, status.connections_total
        ))
        .style(style),
        Cell::from(status.resident_mb.to_string()).style(style),
        Cell::from(format_bytes_compact(status.bytes_in)).style(style),
        Cell::from(format_bytes_compact(status.bytes_out)).style(style),
        Cell::from(format!("{:.1}", status.page_faults_per_sec)).style(style),
    ])
}

fn render_replication(frame: &mut Frame, area: Rect, app: &App) {
    let headers = ["Member", "Set", "State", "Uptime", "Lag", "Optime", "Ping"];
    let header_row = Row::new(headers.iter().map(|header| {
        Cell::from(*header).style(Style::default().add_modifier(Modifier::BOLD))
    }))
    .height(1)
    .style(Style::default().fg(ACCENT));

    let mut rows: Vec<Row> = app
        .snapshot
        .replica_members
        .iter()
        .map(replica_member_row)
        .collect();
    for info in &app.snapshot.replication_info {
        let style = Style::default().fg(Color::White);
        let synced = info
            .synced_to
            .map(|at| at.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        rows.push(Row::new(vec![
            Cell::from(info.server.clone()).style(style),
            Cell::from(format!("source: {}", info.source)).style(style),
            Cell::from("SYNCING").style(style),
            Cell::from("-").style(style),
            Cell::from("-").style(style),
            Cell::from(synced).style(style),
            Cell::from("-").style(style),
        ]));
    }

    let widths = [
        Constraint::Min(16),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(9),
        Constraint::Length(6),
        Constraint::Length(20),
        Constraint::Length(6),
    ];
    let table = Table::new(rows, widths)
        .header(header_row)
        .block(panel_block("Replication"))
        .column_spacing(1);
    frame.render_widget(table, area);
}

fn replica_member_row(member: &ReplicaMember) -> Row<'static> {
    let style = match member.state.as_str() {
        "PRIMARY" => Style::default().fg(ACCENT),
        "SECONDARY" => Style::default().fg(Color::White),
        _ => Style::default().fg(WARN),
    };
    Row::new(vec![
        Cell::from(member.name.clone()).style(style),
        Cell::from(member.set.clone()).style(style),
        Cell::from(member.state.clone()).style(style),
        Cell::from(format_duration_compact(member.uptime_secs)).style(style),
        Cell::from(
            member
                .lag_secs
                .map(|lag| format!("{lag}s"))
                .unwrap_or_else(|| "-".to_string()),
        )
        .style(style),
        Cell::from(member.optime.clone()).style(style),
        Cell::from(
            member
                .ping_ms
                .map(|ping| format!("{ping}ms"))
                .unwrap_or_else(|| "-".to_string()),
        )
        .style(style),
    ])
}

fn render_operations(frame: &mut Frame, area: Rect, app: &App) {
    let headers = ["Server", "OpId", "Client", "Type", "Sec", "Namespace", "Query"];
    let header_row = Row::new(headers.iter().map(|header| {
        Cell::from(*header).style(Style::default().add_modifier(Modifier::BOLD))
    }))
    .height(1)
    .style(Style::default().fg(ACCENT));

    let rows = app.snapshot.operations.iter().map(|operation| {
        let style = match operation.kind {
            OperationKind::ReplicationTailing => Style::default().fg(MUTED),
            OperationKind::Normal if operation.waiting_for_lock => Style::default().fg(WARN),
            OperationKind::Normal => Style::default().fg(Color::White),
        };
        let secs = operation
            .duration_secs
            .map(|secs| secs.to_string())
            .unwrap_or_else(|| "-".to_string());
        let query = if operation.query.is_null() {
            String::new()
        } else {
            compact_text(&operation.query.to_string(), 80)
        };
        Row::new(vec![
            Cell::from(operation.key.server.clone()).style(style),
            Cell::from(operation.key.opid.clone()).style(style),
            Cell::from(operation.client.clone()).style(style),
            Cell::from(operation.op_type.clone()).style(style),
            Cell::from(secs).style(style),
            Cell::from(compact_text(&operation.namespace, 28)).style(style),
            Cell::from(query).style(style),
        ])
    });

    let widths = [
        Constraint::Min(12),
        Constraint::Length(12),
        Constraint::Length(21),
        Constraint::Length(8),
        Constraint::Length(6),
        Constraint::Length(28),
        Constraint::Percentage(100),
    ];
    let title = format!("Operations ({})", app.snapshot.operations.len());
    let table = Table::new(rows, widths)
        .header(header_row)
        .block(panel_block(title))
        .column_spacing(1)
        .row_highlight_style(
            Style::default()
                .bg(Color::Rgb(24, 36, 58))
                .add_modifier(Modifier::BOLD),
        );

    let mut state = TableState::default();
    if !app.snapshot.operations.is_empty() {
        state.select(Some(app.selected));
    }
    frame.render_stateful_widget(table, area, &mut state);
}

fn render_footer(frame: &mut Frame, area: Rect, app: &App) {
    let text = match &app.status_message {
        Some(message) => message.clone(),
        None => {
            "q quit  j/k move  e explain  x kill  K kill older than  p pause  ? help".to_string()
        }
    };
    frame.render_widget(
        Paragraph::new(text).style(Style::default().bg(BG).fg(MUTED)),
        area,
    );
}

fn render_overlay(frame: &mut Frame, overlay: &Overlay) {
    let area = centered_rect(80, 80, frame.area());
    frame.render_widget(Clear, area);
    let paragraph = Paragraph::new(Text::from(overlay.body.clone()))
        .wrap(Wrap { trim: false })
        .block(panel_block(overlay.title.clone()))
        .style(Style::default().fg(Color::White));
    frame.render_widget(paragraph, area);
}

fn render_help_modal(frame: &mut Frame) {
    let area = centered_rect(50, 60, frame.area());
    frame.render_widget(Clear, area);
    let lines = [
        "q        quit",
        "j / ↓    select next operation",
        "k / ↑    select previous operation",
        "g / G    jump to top / bottom",
        "e        explain the selected query",
        "x        kill the selected operation (asks y/n)",
        "K        kill operations older than N seconds",
        "p        pause / resume display updates",
        "Esc      close overlay or message",
    ];
    let text = lines.join("\n");
    let paragraph = Paragraph::new(text)
        .block(panel_block("Keys"))
        .style(Style::default().fg(Color::White));
    frame.render_widget(paragraph, area);
}

fn render_confirmation(frame: &mut Frame, pending: &PendingConfirmation) {
    let prompt = match pending {
        PendingConfirmation::KillOperation { selection } => {
            format!("Kill operation {}? (y/n)", selection.key)
        }
    };
    let area = centered_rect(50, 20, frame.area());
    frame.render_widget(Clear, area);
    let paragraph = Paragraph::new(prompt)
        .block(panel_block("Confirm"))
        .style(Style::default().fg(WARN));
    frame.render_widget(paragraph, area);
}

fn render_prompt(frame: &mut Frame, app: &App) {
    let area = centered_rect(50, 20, frame.area());
    frame.render_widget(Clear, area);
    let text = format!("Kill operations running longer than (seconds): {}_", app.input_buffer);
    let paragraph = Paragraph::new(text)
        .block(panel_block("Batch kill"))
        .style(Style::default().fg(Color::White));
    frame.render_widget(paragraph, area);
}

fn panel_block(title: impl Into<String>) -> Block<'static> {
    Block::default()
        .title(title.into())
        .borders(Borders::ALL)
        .border_style(Style::default().fg(MUTED))
        .style(Style::default().bg(PANEL))
}

fn compact_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let truncated: String = value.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{truncated}…")
}

fn format_bytes_compact(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    if bytes >= GIB {
        format!("{:.1}G", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1}M", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1}K", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes}B")
    }
}

fn format_duration_compact(secs: u64) -> String {
    if secs >= 86_400 {
        format!("{}d", secs / 86_400)
    } else if secs >= 3_600 {
        format!("{}h", secs / 3_600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::{compact_text, format_bytes_compact, format_duration_compact};

    #[test]
    fn compact_text_truncates_with_ellipsis() {
        assert_eq!(compact_text("short", 10), "short");
        let long = "a".repeat(20);
        let shown = compact_text(&long, 10);
        assert_eq!(shown.chars().count(), 10);
        assert!(shown.ends_with('…'));
    }

    #[test]
    fn bytes_format_picks_a_readable_unit() {
        assert_eq!(format_bytes_compact(512), "512B");
        assert_eq!(format_bytes_compact(2 * 1024 * 1024), "2.0M");
    }

    #[test]
    fn duration_format_collapses_to_largest_unit() {
        assert_eq!(format_duration_compact(42), "42s");
        assert_eq!(format_duration_compact(3_700), "1h");
        assert_eq!(format_duration_compact(200_000), "2d");
    }
}
