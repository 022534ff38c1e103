use owo_colors::{OwoColorize, Style};

/// Applies colour and style to terminal text when colour is enabled.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().cyan())
    }

    pub(crate) fn success(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().green())
    }

    pub(crate) fn warning(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().yellow())
    }

    pub(crate) fn muted(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().dimmed())
    }

    pub(crate) fn value(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold())
    }

    /// Styles addresses and UUIDs.
    pub(crate) fn identifier(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().magenta())
    }

    fn paint(&self, text: &str, style: Style) -> String {
        if self.use_colour {
            text.style(style).to_string()
        } else {
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    type Paint = fn(&Painter, &'static str) -> String;

    #[rstest]
    #[case::heading(|p: &Painter, t| p.heading(t))]
    #[case::success(|p: &Painter, t| p.success(t))]
    #[case::warning(|p: &Painter, t| p.warning(t))]
    #[case::muted(|p: &Painter, t| p.muted(t))]
    #[case::value(|p: &Painter, t| p.value(t))]
    #[case::identifier(|p: &Painter, t| p.identifier(t))]
    fn colour_is_applied_only_when_enabled(#[case] paint: Paint) {
        assert_eq!("AA:BB", paint(&Painter::new(false), "AA:BB"));

        let styled = paint(&Painter::new(true), "AA:BB");
        assert_ne!("AA:BB", styled);
        assert!(styled.contains("AA:BB"));
    }
}
