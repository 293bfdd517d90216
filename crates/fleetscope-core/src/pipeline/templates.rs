//! Versioned prompt templates.
//!
//! A template file may start with a `version=N` line; the header is stripped
//! from the body and a missing header means version 1. Bodies reference the
//! placeholders [`REPO_STRUCTURE`], [`REPO_DEPS`] and [`PREVIOUS_CONTEXT`],
//! which are filled in by [`render_prompt`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::ConfigError;

pub const REPO_STRUCTURE: &str = "{repo_structure}";
pub const REPO_DEPS: &str = "{repo_deps}";
pub const PREVIOUS_CONTEXT: &str = "{previous_context}";

pub const TEMPLATE_EXTENSION: &str = "md";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub version: u32,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, Template>,
}

/// `(template name, what the step examines)` for the built-in templates.
const BUILTIN_FOCUS: &[(&str, &str)] = &[
    ("overview", "overall purpose, main technologies and high-level architecture"),
    ("dependencies", "third-party dependencies, what each is used for and how current they are"),
    ("code_structure", "module layout, layering and the responsibilities of the main components"),
    ("api_surface", "externally exposed APIs: HTTP routes, RPC services, CLIs or exported functions"),
    ("database", "databases and data stores, schemas, migrations and data access patterns"),
    ("events_and_messaging", "message queues, event buses, pub/sub topics and async workflows"),
    ("external_services", "calls to external services and third-party APIs"),
    ("authentication", "authentication and authorization mechanisms"),
    ("security", "security posture: secret handling, input validation and known risky patterns"),
    ("configuration", "configuration sources, environment variables and feature flags"),
    ("deployment", "build, packaging and deployment process and target environments"),
    ("monitoring", "logging, metrics, tracing and alerting"),
    ("service_architecture", "service boundaries, request lifecycle and concurrency model"),
    ("data_flow", "how data enters, moves through and leaves the service"),
    ("ui_components", "UI component hierarchy, design system and routing"),
    ("state_management", "client-side state management and data fetching"),
    ("public_api", "the public API of the library and its intended usage"),
    ("versioning_and_compat", "versioning policy, compatibility guarantees and supported platforms"),
    ("resource_inventory", "provisioned cloud resources and how they are grouped"),
    ("environment_topology", "environments, networking topology and promotion between them"),
];

fn builtin_body(focus: &str) -> String {
    [
        "You are analysing a source code repository.",
        "",
        &format!("Focus: {focus}."),
        "",
        "## Repository Structure",
        "",
        REPO_STRUCTURE,
        "",
        REPO_DEPS,
        PREVIOUS_CONTEXT,
        "Answer in Markdown. Cite concrete files. If this aspect does not apply to the repository, reply with exactly: Not applicable.",
    ]
    .join("\n")
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Templates for every built-in step, all at version 1.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for (name, focus) in BUILTIN_FOCUS {
            catalog.insert(Template {
                name: (*name).to_string(),
                version: 1,
                body: builtin_body(focus),
            });
        }
        catalog
    }

    pub fn insert(&mut self, template: Template) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Overlay every `<name>.md` file in `dir`. Returns the number loaded.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, ConfigError> {
        let unreadable = |e: std::io::Error| ConfigError::Unreadable {
            path: dir.display().to_string(),
            reason: e.to_string(),
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(unreadable)? {
            let path = entry.map_err(unreadable)?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TEMPLATE_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let template = Self::parse_template(name, &raw)?;
            debug!(template = %template.name, version = template.version, "loaded template");
            self.insert(template);
        }
        Ok(paths.len())
    }

    /// Split an optional `version=N` header from a template body.
    pub fn parse_template(name: &str, raw: &str) -> Result<Template, ConfigError> {
        let (first, rest) = match raw.split_once('\n') {
            Some((first, rest)) => (first, rest),
            None => (raw, ""),
        };
        let Some(value) = first.trim().strip_prefix("version=") else {
            return Ok(Template {
                name: name.to_string(),
                version: 1,
                body: raw.to_string(),
            });
        };
        let version = value.trim().parse::<u32>().map_err(|e| ConfigError::Malformed {
            what: format!("template {name}"),
            reason: format!("bad version header {value:?}: {e}"),
        })?;
        Ok(Template {
            name: name.to_string(),
            version,
            body: rest.trim_start_matches(['\n', '\r']).to_string(),
        })
    }
}

/// Fill the placeholders of a template body.
pub fn render_prompt(body: &str, repo_structure: &str, dependencies: &str, context: &str) -> String {
    let context_section = if context.is_empty() {
        String::new()
    } else {
        format!("\n\n## Previous Analysis Context\n\n{context}\n\n")
    };
    body.replace(REPO_STRUCTURE, repo_structure)
        .replace(REPO_DEPS, dependencies)
        .replace(PREVIOUS_CONTEXT, &context_section)
}
