/// Sandbox terminal panel controls.
///
/// open/close toggle visibility; play/pause/stop/restart only update the
/// status line. None of them reach the sandbox backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSignal {
    Open,
    Close,
    Play,
    Pause,
    Stop,
    Restart,
}

impl TerminalSignal {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "open" => Some(Self::Open),
            "close" => Some(Self::Close),
            "play" => Some(Self::Play),
            "pause" => Some(Self::Pause),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TerminalSignalRelay {
    visible: bool,
    status: String,
}

impl TerminalSignalRelay {
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn relay(&mut self, signal: TerminalSignal) {
        match signal {
            TerminalSignal::Open => self.visible = true,
            TerminalSignal::Close => self.visible = false,
            TerminalSignal::Play => self.status = "Play...".to_string(),
            TerminalSignal::Pause => self.status = "Pause...".to_string(),
            TerminalSignal::Stop => self.status = "Stop...".to_string(),
            TerminalSignal::Restart => self.status = "Restart...".to_string(),
        }
    }
}
