//! Side panels: one compact section per data source

use super::helpers::truncate;
use crate::app::App;
use crate::beads::DriftStatus;
use crate::config::colors;
use crate::sources::{CheckpointHealth, Severity};
use crate::state::PanelState;
use chrono::{DateTime, Utc};
use ratatui::{
    layout::Rect,
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Paragraph, Wrap},
    Frame,
};

fn heading(title: &str) -> Line<'static> {
    Line::from(Span::styled(
        title.to_string(),
        Style::default()
            .fg(colors::HIGHLIGHT)
            .add_modifier(Modifier::BOLD),
    ))
}

fn dim(text: String) -> Line<'static> {
    Line::from(Span::styled(text, Style::default().fg(colors::IDLE)))
}

/// Lines for a panel's failure modes; `None` when there is data to show
///
/// Unavailable tools collapse to one inert line. Transient failures keep the
/// last data and add a "refreshed N ago" note underneath it.
fn panel_notes<T>(panel: &PanelState<T>, now: DateTime<Utc>) -> (bool, Vec<Line<'static>>) {
    if panel.unavailable {
        return (false, vec![dim("  not available".into())]);
    }
    let mut notes = Vec::new();
    if let Some(err) = &panel.error {
        let age = panel
            .age_label(now)
            .map(|a| format!(" ({a})"))
            .unwrap_or_default();
        notes.push(Line::from(Span::styled(
            format!("  {}: {}{age}", err.kind().code(), truncate(&err.to_string(), 40)),
            Style::default().fg(colors::ERROR),
        )));
    }
    (panel.data.is_some(), notes)
}

fn section<T>(
    lines: &mut Vec<Line<'static>>,
    title: &str,
    panel: &PanelState<T>,
    now: DateTime<Utc>,
    body: impl FnOnce(&T, &mut Vec<Line<'static>>),
) {
    lines.push(heading(title));
    let (has_data, notes) = panel_notes(panel, now);
    if has_data {
        if let Some(data) = &panel.data {
            body(data, lines);
        }
    } else if notes.is_empty() {
        lines.push(dim("  loading…".into()));
    }
    lines.extend(notes);
}

pub fn render_panels(f: &mut Frame, area: Rect, app: &App) {
    let now = Utc::now();
    let p = &app.state.panels;
    let width = area.width.saturating_sub(6) as usize;
    let mut lines: Vec<Line<'static>> = Vec::new();

    section(&mut lines, "Alerts", &p.alerts, now, |alerts, out| {
        if alerts.is_empty() {
            out.push(dim("  all clear".into()));
        }
        for a in alerts.iter().take(5) {
            let color = match a.severity {
                Severity::Critical => colors::ERROR,
                Severity::Warning => colors::ATTENTION,
                Severity::Info => colors::FG,
            };
            out.push(Line::from(Span::styled(
                format!("  {} {}", a.severity.as_str(), truncate(&a.message, width)),
                Style::default().fg(color),
            )));
        }
    });

    section(&mut lines, "Beads", &p.beads, now, |b, out| {
        out.push(Line::from(format!(
            "  {} ready · {} in progress · {} blocked",
            b.counts.ready, b.counts.in_progress, b.counts.blocked
        )));
        for item in b.ready_preview.iter().take(3) {
            out.push(dim(format!(
                "  P{} {} {}",
                item.priority,
                item.id,
                truncate(&item.title, width.saturating_sub(12))
            )));
        }
        if let Some(drift) = &b.drift {
            let color = match drift.status {
                DriftStatus::Critical => colors::ERROR,
                DriftStatus::Warning => colors::ATTENTION,
                DriftStatus::Ok | DriftStatus::NoBaseline => colors::FG,
            };
            out.push(Line::from(Span::styled(
                format!("  drift: {}", truncate(&drift.message, width.saturating_sub(9))),
                Style::default().fg(color),
            )));
        }
    });

    section(&mut lines, "Agent Mail", &p.mail_status, now, |m, out| {
        let c = &app.state.counters;
        out.push(Line::from(format!(
            "  {} · {} reservations · {} conflicts",
            if m.connected { "connected" } else { "offline" },
            m.reservations.len(),
            m.conflicts
        )));
        out.push(Line::from(format!(
            "  {} unread · {} urgent",
            c.mail_unread, c.mail_urgent
        )));
        let inbox = p.mail_inbox.data.as_deref().unwrap_or_default();
        for s in inbox.iter().filter(|s| s.unread > 0).take(3) {
            let acks = if s.pending_acks.is_empty() {
                String::new()
            } else {
                format!(" ({} need ack)", s.pending_acks.len())
            };
            out.push(dim(format!(
                "  {} {}{acks} {}",
                truncate(&s.agent_name, 16),
                s.unread,
                truncate(s.latest_subject.as_deref().unwrap_or(""), width.saturating_sub(30))
            )));
        }
    });

    section(&mut lines, "Routing", &p.routing, now, |scores, out| {
        for s in scores.iter().take(3) {
            out.push(Line::from(format!(
                "  {:>5.1} {} ({})",
                s.score,
                truncate(&s.name, 16),
                truncate(&s.reason, width.saturating_sub(26))
            )));
        }
    });

    section(&mut lines, "Metrics", &p.metrics, now, |m, out| {
        out.push(Line::from(format!(
            "  {:.0}% busy · ctx avg {:.0}% max {:.0}% · {:.0} tok/s",
            m.utilization() * 100.0,
            m.avg_context_percent,
            m.max_context_percent,
            m.total_velocity
        )));
    });

    section(&mut lines, "Code scan", &p.code_scan, now, |s, out| {
        let color = if s.totals.critical > 0 { colors::ERROR } else { colors::OK };
        out.push(Line::from(Span::styled(
            format!(
                "  {} critical · {} warning · {} info ({} files)",
                s.totals.critical, s.totals.warning, s.totals.info, s.files
            ),
            Style::default().fg(color),
        )));
    });

    section(&mut lines, "Checkpoints", &p.checkpoint, now, |c, out| {
        let health = match c.health(now) {
            CheckpointHealth::None => "none",
            CheckpointHealth::Fresh => "fresh",
            CheckpointHealth::Stale => "stale",
        };
        let latest = c
            .latest
            .as_ref()
            .map(|l| truncate(&l.description, width.saturating_sub(20)))
            .unwrap_or_default();
        out.push(Line::from(format!("  {} ({health}) {latest}", c.count)));
    });

    section(&mut lines, "Handoffs", &p.handoff, now, |h, out| {
        let latest = h
            .latest
            .as_ref()
            .map(|l| truncate(&l.title, width.saturating_sub(8)))
            .unwrap_or_else(|| "none".into());
        out.push(Line::from(format!("  {} · {latest}", h.count)));
    });

    section(&mut lines, "Spawn", &p.spawn, now, |s, out| match s {
        Some(batch) if batch.is_active() => out.push(Line::from(format!(
            "  batch {} · {}/{} prompts sent",
            truncate(&batch.batch_id, 12),
            batch.sent(),
            batch.prompts.len()
        ))),
        _ => out.push(dim("  idle".into())),
    });

    section(&mut lines, "Changed files", &p.file_changes, now, |files, out| {
        out.push(Line::from(format!("  {} changed", files.len())));
        for change in files.iter().take(3) {
            out.push(dim(format!(
                "  {} {}",
                change.status,
                truncate(&change.path, width.saturating_sub(4))
            )));
        }
    });

    section(&mut lines, "History", &p.history, now, |entries, out| {
        for e in entries.iter().take(3) {
            out.push(dim(format!(
                "  {} {}",
                e.timestamp.format("%H:%M"),
                truncate(&e.prompt, width.saturating_sub(7))
            )));
        }
    });

    section(&mut lines, "DCG", &p.dcg, now, |d, out| {
        out.push(Line::from(format!(
            "  {} {}",
            if d.active { "active" } else { "inactive" },
            d.version
        )));
    });

    section(&mut lines, "CASS", &p.cass, now, |c, out| {
        if c.hits.is_empty() {
            out.push(dim(format!("  no hits for \"{}\"", truncate(&c.query, 20))));
        }
        for hit in c.hits.iter().take(2) {
            out.push(dim(format!("  {}", truncate(&hit.title, width))));
        }
    });

    let panel = Paragraph::new(lines).wrap(Wrap { trim: false }).block(
        Block::default()
            .title(" Project ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(colors::BORDER))
            .border_type(BorderType::Rounded),
    );
    f.render_widget(panel, area);
}
