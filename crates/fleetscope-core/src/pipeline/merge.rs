//! Merged, publishable view of an analysis record.

use fleetscope_state::AnalysisRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub step_id: String,
    pub content: String,
    /// False for a not-applicable answer, which is published verbatim.
    pub applicable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedResult {
    pub repo_id: String,
    pub branch: String,
    pub commit_id: String,
    pub category: String,
    /// In pipeline order. Steps with empty output are omitted.
    pub sections: Vec<Section>,
}

impl MergedResult {
    pub fn from_record(record: &AnalysisRecord) -> Self {
        Self {
            repo_id: record.repo_id.clone(),
            branch: record.branch.clone(),
            commit_id: record.commit_id.clone(),
            category: record.category.clone(),
            sections: record
                .steps
                .iter()
                .filter(|s| !s.content.trim().is_empty())
                .map(|s| Section {
                    step_id: s.step_id.clone(),
                    content: s.content.trim().to_string(),
                    applicable: s.applicable,
                })
                .collect(),
        }
    }

    /// `# {step}\n\n{content}` per section, joined by blank lines.
    pub fn to_markdown(&self) -> String {
        self.sections
            .iter()
            .map(|s| format!("# {}\n\n{}", s.step_id, s.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetscope_state::{Fingerprint, RunId, StepResult};

    fn step(id: &str, content: &str, applicable: bool) -> StepResult {
        StepResult {
            step_id: id.into(),
            content: content.into(),
            generated_at: Utc::now(),
            template_version: 1,
            applicable,
            usage: Default::default(),
        }
    }

    #[test]
    fn markdown_keeps_pipeline_order_and_not_applicable_answers() {
        let record = AnalysisRecord {
            repo_id: "svc".into(),
            branch: "main".into(),
            commit_id: "abc123".into(),
            fingerprint: Fingerprint::from_bytes(b"x"),
            category: "backend".into(),
            steps: vec![
                step("overview", "An API.\n", true),
                step("database", "Not applicable", false),
                step("security", "Uses TLS.", true),
                step("deployment", "  \n", false),
            ],
            run_id: RunId::new(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
        };
        let merged = MergedResult::from_record(&record);
        assert_eq!(merged.sections.len(), 3);
        assert!(!merged.sections[1].applicable);
        assert_eq!(
            merged.to_markdown(),
            "# overview\n\nAn API.\n\n# database\n\nNot applicable\n\n# security\n\nUses TLS."
        );
    }
}
