use crate::app::InputMode;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Quit,
    Down,
    Up,
    PageDown,
    PageUp,
    Top,
    Bottom,
    Explain,
    Kill,
    BatchKill,
    TogglePause,
    ToggleHelp,
    ConfirmYes,
    ConfirmNo,
    CloseOverlay,
    SubmitInput,
    CancelInput,
    Backspace,
    InputChar(char),
}

pub fn map_key(mode: InputMode, key: KeyEvent) -> Option<Action> {
    match mode {
        InputMode::Normal => map_normal_mode_key(key),
        InputMode::Prompt => map_prompt_mode_key(key),
    }
}

fn map_normal_mode_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Char('q') => Some(Action::Quit),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::Quit),
        KeyCode::Char('j') if key.modifiers.is_empty() => Some(Action::Down),
        KeyCode::Down => Some(Action::Down),
        KeyCode::Char('k') if key.modifiers.is_empty() => Some(Action::Up),
        KeyCode::Up => Some(Action::Up),
        KeyCode::PageDown => Some(Action::PageDown),
        KeyCode::PageUp => Some(Action::PageUp),
        KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Action::PageDown)
        }
        KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::PageUp),
        KeyCode::Char('g') if key.modifiers.is_empty() => Some(Action::Top),
        KeyCode::Home => Some(Action::Top),
        KeyCode::Char('G') => Some(Action::Bottom),
        KeyCode::End => Some(Action::Bottom),
        KeyCode::Char('e') if key.modifiers.is_empty() => Some(Action::Explain),
        KeyCode::Char('x') if key.modifiers.is_empty() => Some(Action::Kill),
        KeyCode::Char('K') => Some(Action::BatchKill),
        KeyCode::Char('p') if key.modifiers.is_empty() => Some(Action::TogglePause),
        KeyCode::Char('?') => Some(Action::ToggleHelp),
        KeyCode::Char('y') | KeyCode::Char('Y') => Some(Action::ConfirmYes),
        KeyCode::Char('n') | KeyCode::Char('N') => Some(Action::ConfirmNo),
        KeyCode::Esc => Some(Action::CloseOverlay),
        _ => None,
    }
}

fn map_prompt_mode_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Esc => Some(Action::CancelInput),
        KeyCode::Enter => Some(Action::SubmitInput),
        KeyCode::Backspace => Some(Action::Backspace),
        KeyCode::Char(c) if key.modifiers.is_empty() || key.modifiers == KeyModifiers::SHIFT => {
            Some(Action::InputChar(c))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, map_key};
    use crate::app::InputMode;
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

    #[test]
    fn normal_mode_maps_quit() {
        let key = KeyEvent::new(KeyCode::Char('q'), KeyModifiers::NONE);
        assert_eq!(map_key(InputMode::Normal, key), Some(Action::Quit));
    }

    #[test]
    fn normal_mode_maps_ctrl_c_to_quit() {
        let key = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(map_key(InputMode::Normal, key), Some(Action::Quit));
    }

    #[test]
    fn normal_mode_maps_vim_navigation() {
        let down = KeyEvent::new(KeyCode::Char('j'), KeyModifiers::NONE);
        let up = KeyEvent::new(KeyCode::Char('k'), KeyModifiers::NONE);
        assert_eq!(map_key(InputMode::Normal, down), Some(Action::Down));
        assert_eq!(map_key(InputMode::Normal, up), Some(Action::Up));
    }

    #[test]
    fn normal_mode_maps_explain_and_kill() {
        let explain = KeyEvent::new(KeyCode::Char('e'), KeyModifiers::NONE);
        let kill = KeyEvent::new(KeyCode::Char('x'), KeyModifiers::NONE);
        assert_eq!(map_key(InputMode::Normal, explain), Some(Action::Explain));
        assert_eq!(map_key(InputMode::Normal, kill), Some(Action::Kill));
    }

    #[test]
    fn normal_mode_maps_shift_k_to_batch_kill() {
        let key = KeyEvent::new(KeyCode::Char('K'), KeyModifiers::SHIFT);
        assert_eq!(map_key(InputMode::Normal, key), Some(Action::BatchKill));
    }

    #[test]
    fn normal_mode_maps_uppercase_confirmation_keys() {
        let yes = KeyEvent::new(KeyCode::Char('Y'), KeyModifiers::SHIFT);
        let no = KeyEvent::new(KeyCode::Char('N'), KeyModifiers::SHIFT);
        assert_eq!(map_key(InputMode::Normal, yes), Some(Action::ConfirmYes));
        assert_eq!(map_key(InputMode::Normal, no), Some(Action::ConfirmNo));
    }

    #[test]
    fn prompt_mode_maps_chars_and_submit() {
        let digit = KeyEvent::new(KeyCode::Char('6'), KeyModifiers::NONE);
        let enter = KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE);
        assert_eq!(
            map_key(InputMode::Prompt, digit),
            Some(Action::InputChar('6'))
        );
        assert_eq!(map_key(InputMode::Prompt, enter), Some(Action::SubmitInput));
    }

    #[test]
    fn prompt_mode_rejects_ctrl_chars() {
        let key = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(map_key(InputMode::Prompt, key), None);
    }

    #[test]
    fn prompt_mode_maps_escape_to_cancel() {
        let key = KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE);
        assert_eq!(map_key(InputMode::Prompt, key), Some(Action::CancelInput));
    }
}
