use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Success => f.write_str("Success"),
            StepStatus::Failed => f.write_str("Failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepEntry {
    pub label: String,
    pub status: StepStatus,
    pub message: String,
}

/// Ordered record of named sub-steps, built incrementally while an action
/// runs and rendered once as a Markdown table.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    entries: Vec<StepEntry>,
}

impl StepReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        label: impl Into<String>,
        status: StepStatus,
        message: impl Into<String>,
    ) {
        self.entries.push(StepEntry { label: label.into(), status, message: message.into() });
    }

    pub fn entries(&self) -> &[StepEntry] {
        &self.entries
    }

    pub fn to_markdown(&self) -> String {
        let mut table = String::from("| Step | Status | Details |\n|------|--------|---------|\n");
        for entry in &self.entries {
            table.push_str(&format!(
                "| {} | {} | {} |\n",
                entry.label, entry.status, entry.message
            ));
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::{StepReport, StepStatus};

    #[test]
    fn test_markdown_table() {
        let mut report = StepReport::new();
        report.push("Clone repository", StepStatus::Success, "Repository cloned successfully.");
        report.push("Deployment script", StepStatus::Failed, "exit status 1");
        assert_eq!(
            report.to_markdown(),
            "| Step | Status | Details |\n\
             |------|--------|---------|\n\
             | Clone repository | Success | Repository cloned successfully. |\n\
             | Deployment script | Failed | exit status 1 |\n"
        );
    }

    #[test]
    fn test_entries_keep_insertion_order() {
        let mut report = StepReport::new();
        report.push("b", StepStatus::Success, "first");
        report.push("a", StepStatus::Success, "second");
        let labels: Vec<_> = report.entries().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, ["b", "a"]);
    }
}
