use super::mode::Mode;
use super::registry::{ModeRegistry, PromptSpec};

#[derive(Debug, Clone, PartialEq)]
pub struct ModeSelection<'a> {
    pub spec: &'a PromptSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

impl ModeSelection<'_> {
    pub fn mode(&self) -> Mode {
        self.spec.mode
    }
}

impl ModeRegistry {
    /// Never fails: absent or unrecognized modes resolve to [`Mode::default`].
    pub fn resolve(&self, requested: Option<&str>) -> ModeSelection<'_> {
        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let (mode, fallback_reason) = match requested.as_deref() {
            Some(raw) => match Mode::parse(raw) {
                Some(mode) => (mode, None),
                None => (
                    Mode::default(),
                    Some(format!(
                        "Unknown mode '{raw}'; using default '{}'.",
                        Mode::default()
                    )),
                ),
            },
            None => (
                Mode::default(),
                Some("No mode specified; using default.".to_string()),
            ),
        };

        ModeSelection {
            spec: self.get(mode),
            requested,
            fallback_reason,
        }
    }
}
