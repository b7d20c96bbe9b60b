// Terminal keyboard control
//
// Lowercase and digit keys step by the small amount, uppercase and
// shifted arrows by the large amount. Esc or Ctrl+C quits.

use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures::StreamExt;
use std::io::IsTerminal;
use tracing::{info, warn};

use crate::config::{STEP_ROTATION_LARGE, STEP_ROTATION_SMALL, STEP_SPEED_LARGE, STEP_SPEED_SMALL};
use crate::messages::Axis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Nudge { axis: Axis, delta: i32 },
    AllStop,
    Quit,
}

fn step(axis: Axis, large: bool) -> i32 {
    match (axis, large) {
        (Axis::Rotation, false) => STEP_ROTATION_SMALL,
        (Axis::Rotation, true) => STEP_ROTATION_LARGE,
        (_, false) => STEP_SPEED_SMALL,
        (_, true) => STEP_SPEED_LARGE,
    }
}

fn nudge(axis: Axis, positive: bool, large: bool) -> KeyAction {
    let delta = step(axis, large);
    KeyAction::Nudge {
        axis,
        delta: if positive { delta } else { -delta },
    }
}

pub fn map_key(event: &KeyEvent) -> Option<KeyAction> {
    if event.kind == KeyEventKind::Release {
        return None;
    }
    if event.modifiers.contains(KeyModifiers::CONTROL) && event.code == KeyCode::Char('c') {
        return Some(KeyAction::Quit);
    }

    let shifted = event.modifiers.contains(KeyModifiers::SHIFT);
    let action = match event.code {
        KeyCode::Char(c) => match c {
            'w' | '8' => nudge(Axis::X, true, false),
            's' | '2' => nudge(Axis::X, false, false),
            'a' | '4' => nudge(Axis::Y, true, false),
            'd' | '6' => nudge(Axis::Y, false, false),
            'q' | '7' => nudge(Axis::Rotation, true, false),
            'e' | '9' => nudge(Axis::Rotation, false, false),
            'W' => nudge(Axis::X, true, true),
            'S' => nudge(Axis::X, false, true),
            'A' => nudge(Axis::Y, true, true),
            'D' => nudge(Axis::Y, false, true),
            'Q' => nudge(Axis::Rotation, true, true),
            'E' => nudge(Axis::Rotation, false, true),
            ' ' | '5' | '0' | 'x' | '.' | '~' => KeyAction::AllStop,
            _ => return None,
        },
        KeyCode::Up => nudge(Axis::X, true, shifted),
        KeyCode::Down => nudge(Axis::X, false, shifted),
        KeyCode::Left => nudge(Axis::Y, true, shifted),
        KeyCode::Right => nudge(Axis::Y, false, shifted),
        KeyCode::Home => nudge(Axis::Rotation, true, shifted),
        KeyCode::PageUp => nudge(Axis::Rotation, false, shifted),
        KeyCode::Enter | KeyCode::KeypadBegin => KeyAction::AllStop,
        KeyCode::Esc => KeyAction::Quit,
        _ => return None,
    };
    Some(action)
}

/// Raw-mode keyboard input; inert when stdin is not a terminal
pub struct Keyboard {
    events: Option<EventStream>,
    raw_mode: bool,
}

impl Keyboard {
    pub fn open() -> std::io::Result<Self> {
        if !std::io::stdin().is_terminal() {
            info!("stdin is not a terminal, keyboard control disabled");
            return Ok(Self::inert());
        }
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self {
            events: Some(EventStream::new()),
            raw_mode: true,
        })
    }

    /// Keyboard that never produces input
    pub fn inert() -> Self {
        Self {
            events: None,
            raw_mode: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.events.is_some()
    }

    /// Wait for the next mapped key. Never resolves once input is gone.
    pub async fn next_action(&mut self) -> KeyAction {
        loop {
            let Some(events) = self.events.as_mut() else {
                return std::future::pending().await;
            };
            let next = events.next().await;
            match next {
                Some(Ok(Event::Key(key))) => {
                    if let Some(action) = map_key(&key) {
                        return action;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Keyboard input failed, disabling: {}", e);
                    self.events = None;
                }
                None => {
                    info!("Keyboard input closed");
                    self.events = None;
                }
            }
        }
    }
}

impl Drop for Keyboard {
    fn drop(&mut self) {
        if self.raw_mode {
            if let Err(e) = crossterm::terminal::disable_raw_mode() {
                warn!("Failed to restore terminal: {}", e);
            }
        }
    }
}
