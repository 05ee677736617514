//! Accumulated findings for multi-step operations
//!
//! Storage commands touch many spans and stripes; one bad device must not
//! stop the rest. Each step records what it found here and the driver
//! reports the whole list at the end.

use crate::error::Error;
use std::fmt;

/// How serious a finding is
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational, e.g. "writing not enabled"
    Info,
    /// Recovered or skipped, processing continued
    Warning,
    /// The affected span or stripe could not be processed
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// A single finding
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)
    }
}

/// Ordered list of findings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    #[must_use]
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, severity: Severity, message: impl Into<String>) {
        self.items.push(Diagnostic {
            severity,
            message: message.into(),
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(Severity::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(Severity::Warning, message);
    }

    pub fn fatal(&mut self, message: impl Into<String>) {
        self.push(Severity::Fatal, message);
    }

    /// Record an error as a fatal finding for the affected item
    pub fn error(&mut self, err: &Error) {
        self.fatal(err.to_string());
    }

    /// Append all findings of `other`, preserving order
    pub fn merge(&mut self, other: Self) {
        self.items.extend(other.items);
    }

    #[must_use]
    pub fn has_fatal(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Fatal)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    /// Number of findings at `severity`
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.items.iter().filter(|d| d.severity == severity).count()
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.items {
            writeln!(f, "{d}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_preserves_order() {
        let mut a = Diagnostics::new();
        a.info("first");
        let mut b = Diagnostics::new();
        b.warn("second");
        b.fatal("third");
        a.merge(b);

        let messages: Vec<&str> = a.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert!(a.has_fatal());
        assert_eq!(a.count(Severity::Warning), 1);
    }

    #[test]
    fn test_no_fatal() {
        let mut d = Diagnostics::new();
        d.info("writing not enabled");
        d.error(&Error::NoStripes);
        assert_eq!(d.len(), 2);
        assert!(d.has_fatal());

        let clean = Diagnostics::new();
        assert!(clean.is_empty());
        assert!(!clean.has_fatal());
    }

    #[test]
    fn test_display() {
        let mut d = Diagnostics::new();
        d.warn("segment 3 freelist reset");
        assert_eq!(d.to_string(), "[warning] segment 3 freelist reset\n");
    }
}
