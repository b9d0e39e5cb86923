pub use console::{Style, Term};

/// Terminal styling for the end-of-run summary on stderr. Hit records are
/// plain JSONL on stdout and never styled.
pub struct Styles {
    pub heading: Style,
    pub hit_count: Style,
}

impl Styles {
    pub fn new(use_color: bool) -> Self {
        // An attribute-free Style emits no escape codes at all.
        if !use_color {
            return Self { heading: Style::new(), hit_count: Style::new() };
        }
        Self {
            heading: Style::new().bold().force_styling(true),
            hit_count: Style::new().bold().yellow().force_styling(true),
        }
    }
}
