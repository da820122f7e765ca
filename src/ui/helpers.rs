//! Formatting and layout helpers shared by the dashboard widgets

use crate::config::colors;
use crate::state::HealthStatus;
use crate::status::StatusKind;
use ratatui::layout::{Constraint, Flex, Layout, Rect};
use ratatui::style::Color;

/// Cut `s` to at most `max_len` chars, marking the cut with an ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 1).collect();
        format!("{head}…")
    }
}

pub fn state_color(state: StatusKind) -> Color {
    match state {
        StatusKind::Working => colors::WORKING,
        StatusKind::Idle => colors::IDLE,
        StatusKind::Error => colors::ERROR,
        StatusKind::RateLimited => colors::ATTENTION,
        StatusKind::Compacted => colors::COMPACTING,
        StatusKind::Unknown => colors::BORDER,
    }
}

pub fn health_color(health: HealthStatus) -> Color {
    match health {
        HealthStatus::Ok => colors::OK,
        HealthStatus::Warning => colors::COMPACTING,
        HealthStatus::Error => colors::ERROR,
    }
}

/// Ten-cell bar for a 0-100 percentage
pub fn context_bar(percent: f64) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 10.0).round()) as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled))
}

/// Overlay area taking the given share of `area`, centered on both axes
pub fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let [row] = Layout::vertical([Constraint::Percentage(percent_y)])
        .flex(Flex::Center)
        .areas(area);
    let [cell] = Layout::horizontal([Constraint::Percentage(percent_x)])
        .flex(Flex::Center)
        .areas(row);
    cell
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("héllo wörld", 5), "héll…");
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("x", 0), "");
    }

    #[test]
    fn test_context_bar_clamps() {
        assert_eq!(context_bar(0.0), "░░░░░░░░░░");
        assert_eq!(context_bar(150.0), "██████████");
        assert_eq!(context_bar(54.0).chars().filter(|c| *c == '█').count(), 5);
    }

    #[test]
    fn test_centered_rect_sits_in_the_middle() {
        let area = Rect::new(0, 0, 100, 40);
        let popup = centered_rect(50, 50, area);
        assert_eq!((popup.width, popup.height), (50, 20));
        assert_eq!((popup.x, popup.y), (25, 10));
    }
}
