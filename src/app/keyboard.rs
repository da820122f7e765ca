//! Keyboard input handling

use super::App;
use crate::refresh::SourceId;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

impl App {
    /// Handle keyboard input
    pub fn handle_key(&mut self, key: KeyEvent) {
        // Handle Ctrl+C always
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return;
        }

        if self.show_help {
            self.show_help = false;
            return;
        }

        // While zoomed only a way back (or out) is accepted
        if self.zoomed.is_some() {
            match key.code {
                KeyCode::Char('z') | KeyCode::Esc | KeyCode::Enter => self.toggle_zoom(),
                KeyCode::Char('q') => self.should_quit = true,
                _ => {}
            }
            return;
        }

        self.handle_key_normal(key);
    }

    fn handle_key_normal(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Char('j') | KeyCode::Down => {
                self.state.select_next();
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.state.select_prev();
            }
            // Refresh everything now, superseding slow in-flight fetches
            KeyCode::Char('r') => {
                self.orchestrator.request_refresh(None, true);
                self.show_status("Refreshing all sources");
            }
            KeyCode::Char('s') => {
                self.orchestrator
                    .request_refresh(Some(SourceId::CodeScan), true);
                self.show_status("Rescanning project");
            }
            KeyCode::Char('z') | KeyCode::Enter => {
                self.toggle_zoom();
            }
            KeyCode::Char('c') => {
                self.recover_selected();
            }
            KeyCode::Char('a') => {
                self.acknowledge_selected();
            }
            KeyCode::Char('X') => {
                self.force_release_selected();
            }
            KeyCode::Char('d') => {
                self.debug_mode = !self.debug_mode;
                tracing::debug!(debug_mode = self.debug_mode, "Toggled event log");
            }
            KeyCode::Char('?' | 'h') => {
                self.show_help = !self.show_help;
            }
            _ => {}
        }
    }
}
