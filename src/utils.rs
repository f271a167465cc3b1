use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("#>-")
});

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Explicit timing span. Created via [`Stopwatch::start`], reports the
/// elapsed time through tracing when dropped.
pub(crate) struct Stopwatch {
    name: &'static str,
    start: Instant,
}

impl Stopwatch {
    pub(crate) fn start(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        tracing::debug!(
            "{} took {}ms",
            self.name,
            self.start.elapsed().as_millis()
        );
    }
}

/// Renders the names of currently active jobs into a short message for the
/// progress bar, truncated past five entries.
pub(crate) fn format_active(active: &BTreeSet<String>) -> String {
    const MAX: usize = 5;
    let names: Vec<_> = active.iter().cloned().collect();

    if names.len() <= MAX {
        names.join(", ")
    } else {
        format!("{}… ({} total)", names[..MAX].join(", "), names.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_active_short() {
        let mut active = BTreeSet::new();
        active.insert("app#compileJava".to_string());
        active.insert("app#jar".to_string());
        assert_eq!(format_active(&active), "app#compileJava, app#jar");
    }

    #[test]
    fn test_format_active_truncates() {
        let active: BTreeSet<_> = (0..8).map(|i| format!("m#task{i}")).collect();
        let msg = format_active(&active);
        assert!(msg.ends_with("(8 total)"));
    }
}
