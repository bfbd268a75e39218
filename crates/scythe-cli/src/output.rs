//! Status lines and the per-module progress bar, all on stderr

use console::{style, StyledObject, Term};
use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str = "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Done,
    Warn,
    Fail,
}

impl Status {
    const fn plain(self) -> &'static str {
        match self {
            Self::Done => "done:",
            Self::Warn => "warning:",
            Self::Fail => "error:",
        }
    }

    fn styled(self) -> StyledObject<&'static str> {
        let tag = style(self.plain()).bold();
        match self {
            Self::Done => tag.green(),
            Self::Warn => tag.yellow(),
            Self::Fail => tag.red(),
        }
    }
}

/// Reports progress while modules are loaded
///
/// Stdout stays reserved for the summary so `--json` output can be piped.
#[derive(Debug)]
pub struct ProgressReporter {
    term: Term,
    bar: Option<ProgressBar>,
    use_color: bool,
    quiet: bool,
}

impl ProgressReporter {
    /// Reporter writing to stderr
    #[must_use]
    pub fn new(use_color: bool, quiet: bool) -> Self {
        Self {
            term: Term::stderr(),
            bar: None,
            use_color,
            quiet,
        }
    }

    /// Show a bar over `total` modules when stderr is a terminal
    pub fn start_progress(&mut self, total: u64, message: &str) {
        if self.quiet || !self.term.is_term() {
            return;
        }
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        let bar = ProgressBar::new(total).with_style(style);
        bar.set_message(message.to_string());
        self.bar = Some(bar);
    }

    /// Step the bar, naming the module about to load
    pub fn advance(&self, module: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(module.to_string());
            bar.inc(1);
        }
    }

    /// Remove the bar before the summary is printed
    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }

    /// Final line of a successful run
    pub fn success(&self, message: &str) {
        if !self.quiet {
            self.emit(Status::Done, message);
        }
    }

    /// Something the user should look at; the run continues
    pub fn warning(&self, message: &str) {
        if !self.quiet {
            self.emit(Status::Warn, message);
        }
    }

    /// Printed even with `-q`
    pub fn failure(&self, message: &str) {
        self.emit(Status::Fail, message);
    }

    fn render(&self, status: Status, message: &str) -> String {
        if self.use_color {
            format!("{} {message}", status.styled())
        } else {
            format!("{} {message}", status.plain())
        }
    }

    fn emit(&self, status: Status, message: &str) {
        let line = self.render(status, message);
        match &self.bar {
            Some(bar) => bar.suspend(|| {
                let _ = self.term.write_line(&line);
            }),
            None => {
                let _ = self.term.write_line(&line);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_reporter_never_draws_a_bar() {
        let mut reporter = ProgressReporter::new(false, true);
        reporter.start_progress(3, "loading");
        assert!(reporter.bar.is_none());
        reporter.advance("app/Foo");
        reporter.finish();
    }

    #[test]
    fn test_plain_rendering() {
        let reporter = ProgressReporter::new(false, false);
        assert_eq!(reporter.render(Status::Fail, "app/Foo"), "error: app/Foo");
        assert_eq!(reporter.render(Status::Warn, "x"), "warning: x");
    }

    #[test]
    fn test_colored_rendering_keeps_message() {
        let reporter = ProgressReporter::new(true, false);
        assert!(reporter.render(Status::Done, "3 modules").ends_with(" 3 modules"));
    }
}
