//! Repository-facing domain types.

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Resolved repository category. Determines which category-specific steps
/// run after the base steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    InfraAsCode,
    Libraries,
    Frontend,
    Backend,
    Generic,
}

impl Category {
    /// Evaluation order for classification; earlier wins ties.
    pub const PRIORITY: [Category; 5] = [
        Category::InfraAsCode,
        Category::Libraries,
        Category::Frontend,
        Category::Backend,
        Category::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::InfraAsCode => "infra-as-code",
            Category::Libraries => "libraries",
            Category::Frontend => "frontend",
            Category::Backend => "backend",
            Category::Generic => "generic",
        }
    }

    /// Parse a category name, accepting common aliases.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        let normalized = name.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "infra-as-code" | "infra" | "iac" | "infrastructure" => Ok(Category::InfraAsCode),
            "libraries" | "library" | "lib" => Ok(Category::Libraries),
            "frontend" | "front-end" | "web" => Ok(Category::Frontend),
            "backend" | "back-end" | "service" => Ok(Category::Backend),
            "generic" => Ok(Category::Generic),
            _ => Err(ConfigError::UnknownCategory {
                name: name.to_string(),
            }),
        }
    }
}

impl std::str::FromStr for Category {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::parse(s)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_branch() -> String {
    "main".to_string()
}

/// One repository of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub name: String,
    pub url: String,
    /// Declared category name; parsed lazily so a bad name fails only this repo.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl RepositoryDescriptor {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            category: None,
            branch: default_branch(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }
}

/// Model selection passed through to the analysis provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub max_tokens: u32,
}

impl ModelConfig {
    pub const DEFAULT_MODEL: &'static str = "claude-sonnet-4-20250514";
    pub const DEFAULT_MAX_TOKENS: u32 = 6000;
    pub const MIN_MAX_TOKENS: u32 = 100;
    pub const MAX_MAX_TOKENS: u32 = 8000;
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: Self::DEFAULT_MODEL.to_string(),
            max_tokens: Self::DEFAULT_MAX_TOKENS,
        }
    }
}

/// Cache bypass flags for one investigation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceFlags {
    /// Skip cache lookup and step reuse entirely.
    pub global: bool,
    /// Re-execute only this step; reuse the rest.
    pub step: Option<String>,
}

impl ForceFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.global || self.step.is_some()
    }
}

/// Everything a controller needs to investigate one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationRequest {
    pub descriptor: RepositoryDescriptor,
    /// Category name that bypasses classification (fleet override, else the
    /// descriptor's declared category).
    pub category_override: Option<String>,
    pub force: ForceFlags,
    pub model: ModelConfig,
}

impl InvestigationRequest {
    pub fn new(descriptor: RepositoryDescriptor) -> Self {
        let category_override = descriptor.category.clone();
        Self {
            descriptor,
            category_override,
            force: ForceFlags::none(),
            model: ModelConfig::default(),
        }
    }

    pub fn repo_id(&self) -> &str {
        &self.descriptor.name
    }
}

/// Remote head observed during cache check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoHead {
    pub repo_id: String,
    pub branch: String,
    pub commit_id: String,
}
