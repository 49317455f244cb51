use std::fmt::{Display, Formatter};

/// Outcome of a full consistency check of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub records: u64,
    /// Problems found, prefixed by the component that reported them
    pub problems: Vec<String>,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty()
    }

    pub(crate) fn extend(&mut self, component: &str, problems: Vec<String>) {
        self.problems
            .extend(problems.into_iter().map(|problem| format!("{}: {}", component, problem)));
    }

    pub(crate) fn push(&mut self, component: &str, problem: String) {
        self.problems.push(format!("{}: {}", component, problem));
    }
}

impl Display for IntegrityReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_consistent() {
            return write!(f, "{} records, consistent", self.records);
        }
        write!(f, "{} records, {} problems", self.records, self.problems.len())?;
        for problem in &self.problems {
            write!(f, "\n  {}", problem)?;
        }
        Ok(())
    }
}
