//! Console stand-in for the button and slider control window.

use tonebridge_core::{
    event::MAX_KEY, BridgeError, ControlBridge, ControlEvent, PanelConfig, Result,
};
use tracing::debug;

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelCommand {
    /// Press the button.
    Note,
    /// Move the pitch slider.
    Slider(f32),
    /// A raw `i ...` or `c ...` line event.
    Line(String),
    Status,
    Quit,
}

impl PanelCommand {
    /// Blank lines parse to `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let Some(word) = words.next() else {
            return Ok(None);
        };

        let command = match word {
            "note" | "n" => Self::Note,
            "slider" | "s" => {
                let value = words
                    .next()
                    .ok_or_else(|| BridgeError::InvalidEvent("`slider` needs a value".into()))?;
                let value = value.parse::<f32>().map_err(|_| {
                    BridgeError::InvalidEvent(format!("bad slider value `{value}`"))
                })?;
                Self::Slider(value)
            }
            "status" => Self::Status,
            "quit" | "q" | "exit" => Self::Quit,
            _ if word.starts_with('i') || word.starts_with('c') => Self::Line(line.to_string()),
            other => {
                return Err(BridgeError::InvalidEvent(format!(
                    "unknown command `{other}` (try note, slider <v>, i ..., c ..., status, quit)"
                )))
            }
        };
        Ok(Some(command))
    }
}

/// Holds the slider position and turns widget actions into control events.
#[derive(Debug)]
pub struct ControlPanel {
    config: PanelConfig,
    pitch: f32,
    bridge: ControlBridge,
}

impl ControlPanel {
    pub fn new(config: PanelConfig, bridge: ControlBridge) -> Self {
        Self {
            pitch: config.default_pitch,
            config,
            bridge,
        }
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn is_live(&self) -> bool {
        self.bridge.is_live()
    }

    /// Button handler: plays the configured note at the slider's pitch.
    pub fn on_click_button(&self) -> Result<()> {
        let event = ControlEvent::note_on(
            self.config.instrument,
            self.config.duration,
            self.pitch,
            self.config.velocity,
        );
        debug!(%event, "button pressed");
        self.bridge.send(event)
    }

    /// Slider handler.
    pub fn on_slider_move(&mut self, value: f32) -> Result<()> {
        self.bridge
            .send(ControlEvent::parameter(self.config.pitch_slider, value))?;
        self.pitch = value.clamp(0.0, MAX_KEY);
        Ok(())
    }

    /// Runs one non-status command. Returns false when the panel should close.
    pub fn handle(&mut self, command: PanelCommand) -> Result<bool> {
        match command {
            PanelCommand::Note => self.on_click_button()?,
            PanelCommand::Slider(value) => self.on_slider_move(value)?,
            PanelCommand::Line(line) => self.bridge.send_line(&line)?,
            PanelCommand::Status => {}
            PanelCommand::Quit => return Ok(false),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonebridge_core::{EngineSession, NullSink, SessionConfig, ToneEngine};

    fn session() -> EngineSession {
        let mut session = EngineSession::new(ToneEngine::new(), NullSink::free_running());
        session.configure(SessionConfig::default()).unwrap();
        session
    }

    #[test]
    fn parses_console_lines() {
        assert_eq!(PanelCommand::parse("  ").unwrap(), None);
        assert_eq!(PanelCommand::parse("note").unwrap(), Some(PanelCommand::Note));
        assert_eq!(
            PanelCommand::parse("slider 72").unwrap(),
            Some(PanelCommand::Slider(72.0))
        );
        assert_eq!(
            PanelCommand::parse("i 1 0 2 64 70").unwrap(),
            Some(PanelCommand::Line("i 1 0 2 64 70".into()))
        );
        assert_eq!(PanelCommand::parse("q").unwrap(), Some(PanelCommand::Quit));
        assert!(PanelCommand::parse("slider").is_err());
        assert!(PanelCommand::parse("slider high").is_err());
        assert!(PanelCommand::parse("volume 3").is_err());
    }

    #[test]
    fn widgets_enqueue_events() {
        let session = session();
        let mut panel = ControlPanel::new(PanelConfig::default(), session.bridge());
        assert_eq!(panel.pitch(), 60.0);

        panel.on_click_button().unwrap();
        panel.on_slider_move(72.0).unwrap();
        assert_eq!(panel.pitch(), 72.0);
        assert!(panel.handle(PanelCommand::Line("c 1 40".into())).unwrap());
        assert_eq!(session.bridge().pending(), 3);

        assert!(!panel.handle(PanelCommand::Quit).unwrap());
    }

    #[test]
    fn bad_line_events_are_reported() {
        let session = session();
        let mut panel = ControlPanel::new(PanelConfig::default(), session.bridge());
        assert!(panel.handle(PanelCommand::Line("i 1 0".into())).is_err());
        assert_eq!(session.bridge().pending(), 0);
    }

    #[test]
    fn rejected_slider_value_keeps_the_pitch() {
        let session = session();
        let mut panel = ControlPanel::new(PanelConfig::default(), session.bridge());
        assert!(panel.on_slider_move(f32::NAN).is_err());
        assert_eq!(panel.pitch(), 60.0);

        panel.on_slider_move(300.0).unwrap();
        assert_eq!(panel.pitch(), 127.0);
        panel.on_click_button().unwrap();
        assert_eq!(session.bridge().pending(), 2);
    }

    #[test]
    fn stopped_session_ignores_the_panel() {
        let mut session = session();
        let panel = ControlPanel::new(PanelConfig::default(), session.bridge());
        session.stop();
        assert!(!panel.is_live());
        panel.on_click_button().unwrap();
        assert_eq!(session.bridge().pending(), 0);
    }
}
