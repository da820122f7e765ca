//! UI rendering
//!
//! A thin layout over the view-model store: header with counters, pane table,
//! preview of the selected pane, and a column of project panels. Rendering
//! only reads `App`; nothing here mutates state.

mod helpers;
mod panels;

use crate::app::App;
use crate::config::colors;
use crate::refresh::SourceId;
use crate::sources::Severity;
use crate::status::StatusKind;
use chrono::Utc;
use helpers::{centered_rect, context_bar, health_color, state_color, truncate};
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Clear, Paragraph, Row, Table, TableState, Wrap},
    Frame,
};

/// Preview lines shown for the selected pane
const PREVIEW_HEIGHT: u16 = 12;

/// Main render function
pub fn render(f: &mut Frame, app: &App) {
    let banner = banner_lines(app);
    let banner_height = if banner.is_empty() { 0 } else { banner.len() as u16 + 2 };

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),             // Header
            Constraint::Length(banner_height), // Error banner
            Constraint::Min(8),                // Body
            Constraint::Length(1),             // Footer
        ])
        .split(f.area());

    render_header(f, chunks[0], app);
    if !banner.is_empty() {
        render_banner(f, chunks[1], banner);
    }

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(chunks[2]);
    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(5), Constraint::Length(PREVIEW_HEIGHT)])
        .split(body[0]);

    render_pane_table(f, left[0], app);
    render_preview(f, left[1], app);
    panels::render_panels(f, body[1], app);
    render_footer(f, chunks[3], app);

    if app.debug_mode && !app.coordinator_log.is_empty() {
        render_event_log(f, app);
    }
    if app.show_help {
        render_help(f);
    }
}

fn bordered(title: &str) -> Block<'_> {
    Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(colors::BORDER))
        .border_type(BorderType::Rounded)
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let c = &app.state.counters;
    let total = c.total_agents();

    let status_parts: Vec<String> = [
        StatusKind::Working,
        StatusKind::Idle,
        StatusKind::Error,
        StatusKind::RateLimited,
        StatusKind::Compacted,
    ]
    .iter()
    .filter(|s| c.state(**s) > 0)
    .map(|s| format!("{} {}", c.state(*s), s.as_str()))
    .collect();

    let mut spans = vec![Span::styled(
        format!("ntm · {}", app.state.session),
        Style::default().fg(colors::FG).add_modifier(Modifier::BOLD),
    )];
    if total > 0 {
        spans.push(Span::raw(format!(
            " ({total} agents: {})",
            status_parts.join(", ")
        )));
    }
    let critical = c.alerts(Severity::Critical);
    if critical > 0 {
        spans.push(Span::styled(
            format!("  ⚠ {critical}"),
            Style::default().fg(colors::ERROR),
        ));
    }
    if c.mail_conflicts > 0 {
        spans.push(Span::styled(
            format!("  ⇄ {} conflicts", c.mail_conflicts),
            Style::default().fg(colors::ATTENTION),
        ));
    }
    if c.beads_ready > 0 {
        spans.push(Span::raw(format!("  {} ready", c.beads_ready)));
    }
    if app.zoomed.is_some() {
        spans.push(Span::styled(
            " [ZOOMED]",
            Style::default().fg(colors::HIGHLIGHT),
        ));
    }

    let header = Paragraph::new(Line::from(spans))
        .alignment(Alignment::Center)
        .block(bordered(""));
    f.render_widget(header, area);
}

/// Session errors and auth-blocked sources, each with a hint
fn banner_lines(app: &App) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    if let Some(err) = &app.state.session_error {
        lines.push(Line::from(Span::styled(
            err.to_string(),
            Style::default().fg(colors::ERROR).add_modifier(Modifier::BOLD),
        )));
        lines.push(Line::from(Span::styled(
            err.hint().to_string(),
            Style::default().fg(colors::FG),
        )));
    }
    let blocked: Vec<&str> = SourceId::ALL
        .iter()
        .filter(|id| app.orchestrator.source(**id).is_some_and(|s| s.blocked()))
        .map(|id| id.name())
        .collect();
    if !blocked.is_empty() {
        lines.push(Line::from(Span::styled(
            format!("Unauthorized: {} paused. Check the Agent Mail token, then press r", blocked.join(", ")),
            Style::default().fg(colors::ATTENTION),
        )));
    }
    lines
}

fn render_banner(f: &mut Frame, area: Rect, lines: Vec<Line<'static>>) {
    let banner = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(bordered(" Error ").border_style(Style::default().fg(colors::ERROR)));
    f.render_widget(banner, area);
}

fn render_pane_table(f: &mut Frame, area: Rect, app: &App) {
    let now = Utc::now();
    let rows: Vec<Row> = app
        .state
        .panes
        .iter()
        .map(|pane| {
            let name = app
                .state
                .agent_names
                .get(&pane.id)
                .cloned()
                .unwrap_or_default();
            match app.state.agents.get(&pane.id) {
                Some(agent) => {
                    let state = agent.state();
                    let ctx = if agent.context.tokens_limit > 0 {
                        format!(
                            "{} {:>3.0}%",
                            context_bar(agent.context.usage_percent),
                            agent.context.usage_percent
                        )
                    } else {
                        String::new()
                    };
                    let mut title = truncate(&pane.title, 24);
                    if agent.is_rotating {
                        title.push_str(" ↻");
                    }
                    let stalled = if agent.is_stalled(now) { " stalled" } else { "" };
                    Row::new(vec![
                        Span::raw(pane.index.to_string()),
                        Span::raw(title),
                        Span::raw(agent.agent_type.alias().to_string()),
                        Span::styled(
                            format!("{}{stalled}", state.as_str()),
                            Style::default().fg(state_color(state)),
                        ),
                        Span::raw(ctx),
                        Span::styled(
                            format!("{:?}", agent.health.status).to_lowercase(),
                            Style::default().fg(health_color(agent.health.status)),
                        ),
                        Span::raw(truncate(&name, 14)),
                    ])
                }
                None => Row::new(vec![
                    Span::raw(pane.index.to_string()),
                    Span::raw(truncate(&pane.title, 24)),
                    Span::styled(pane.command.clone(), Style::default().fg(colors::IDLE)),
                ]),
            }
        })
        .collect();

    let widths = [
        Constraint::Length(3),
        Constraint::Length(26),
        Constraint::Length(5),
        Constraint::Length(20),
        Constraint::Length(16),
        Constraint::Length(8),
        Constraint::Min(8),
    ];
    let header = Row::new(vec!["#", "pane", "type", "state", "context", "health", "agent"])
        .style(Style::default().fg(colors::IDLE));
    let updated = app
        .state
        .session_updated_at
        .map(|t| format!(" Panes · {} ", t.format("%H:%M:%S")))
        .unwrap_or_else(|| " Panes ".to_string());
    let table = Table::new(rows, widths)
        .header(header)
        .row_highlight_style(Style::default().bg(colors::BG_LIGHT).add_modifier(Modifier::BOLD))
        .block(bordered(&updated));

    let mut table_state = TableState::default();
    if !app.state.panes.is_empty() {
        table_state.select(Some(app.state.cursor));
    }
    f.render_stateful_widget(table, area, &mut table_state);
}

fn render_preview(f: &mut Frame, area: Rect, app: &App) {
    let Some(pane) = app.state.selected_pane() else {
        f.render_widget(Paragraph::new("No panes").block(bordered(" Preview ")), area);
        return;
    };
    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = app
        .state
        .previews
        .get(&pane.id)
        .map(|p| {
            let skip = p.len().saturating_sub(visible);
            p.iter().skip(skip).map(|l| Line::from(l.as_str())).collect()
        })
        .unwrap_or_default();
    let mut title = format!(" {} ", pane.title);
    if let Some(agent) = app.state.selected_agent() {
        if let Some(model) = &agent.context.model_name {
            title = format!(" {} · {} ", pane.title, model);
        }
        if !agent.health.issues.is_empty() {
            title.push_str(&format!("· {} ", agent.health.issues.join("; ")));
        }
    }
    f.render_widget(Paragraph::new(lines).block(bordered(&title)), area);
}

fn render_footer(f: &mut Frame, area: Rect, app: &App) {
    let text = match &app.status_message {
        Some((msg, _)) => Line::from(Span::styled(msg.clone(), Style::default().fg(colors::FG))),
        None if app.zoomed.is_some() => Line::from(Span::styled(
            "zoomed: z/Esc return · q quit",
            Style::default().fg(colors::IDLE),
        )),
        None => Line::from(Span::styled(
            "j/k select · z zoom · r refresh · s scan · c recover · a ack mail · X release · d events · ? help · q quit",
            Style::default().fg(colors::IDLE),
        )),
    };
    f.render_widget(Paragraph::new(text), area);
}

fn render_event_log(f: &mut Frame, app: &App) {
    let area = centered_rect(70, 50, f.area());
    let visible = area.height.saturating_sub(2) as usize;
    let skip = app.coordinator_log.len().saturating_sub(visible);
    let lines: Vec<Line> = app
        .coordinator_log
        .iter()
        .skip(skip)
        .map(|ev| {
            Line::from(format!(
                "{} {:?} {}",
                ev.at.format("%H:%M:%S"),
                ev.kind,
                ev.message
            ))
        })
        .collect();
    f.render_widget(Clear, area);
    f.render_widget(
        Paragraph::new(lines).block(bordered(" Coordinator events ")),
        area,
    );
}

fn render_help(f: &mut Frame) {
    let area = centered_rect(50, 60, f.area());
    let keys = [
        ("j / ↓", "next pane"),
        ("k / ↑", "previous pane"),
        ("z / Enter", "zoom into pane (pauses refresh)"),
        ("r", "refresh everything now"),
        ("s", "rerun code scan"),
        ("c", "send compaction recovery prompt"),
        ("a", "acknowledge the selected agent's mail"),
        ("X", "force-release a conflicting reservation"),
        ("d", "toggle coordinator event log"),
        ("?", "toggle help"),
        ("q / Esc", "quit"),
    ];
    let lines: Vec<Line> = keys
        .iter()
        .map(|(k, v)| {
            Line::from(vec![
                Span::styled(format!("{k:>10}  "), Style::default().fg(colors::HIGHLIGHT)),
                Span::raw(*v),
            ])
        })
        .collect();
    f.render_widget(Clear, area);
    f.render_widget(Paragraph::new(lines).block(bordered(" Help ")), area);
}
