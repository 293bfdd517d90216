//! Declarative step registry and pipeline construction.
//!
//! A pipeline is the base steps in declared order followed by the resolved
//! category's steps in declared order. Order is positional; dependencies
//! must point backwards. Validation happens here, never at execution time.

use std::collections::{BTreeMap, HashMap, HashSet};

use fleetscope_state::Fingerprint;
use serde::{Deserialize, Serialize};

use super::templates::{Template, TemplateCatalog};
use crate::domain::{Category, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepScope {
    Base,
    Category(Category),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptStep {
    pub id: String,
    /// Template name in the catalog.
    pub template: String,
    pub depends_on: Vec<String>,
    /// A failing optional step is skipped instead of failing the pipeline.
    pub required: bool,
    pub scope: StepScope,
}

impl PromptStep {
    pub fn base(id: &str, depends_on: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            template: id.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            required: true,
            scope: StepScope::Base,
        }
    }

    pub fn for_category(category: Category, id: &str, depends_on: &[&str]) -> Self {
        Self {
            scope: StepScope::Category(category),
            ..Self::base(id, depends_on)
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.template = template.to_string();
        self
    }
}

/// A step bound to the template version it runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub step: PromptStep,
    pub template: Template,
}

impl ResolvedStep {
    pub fn id(&self) -> &str {
        &self.step.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPipeline {
    pub category: Category,
    pub steps: Vec<ResolvedStep>,
    /// Identity over category, step order and template versions.
    pub fingerprint: Fingerprint,
}

impl PromptPipeline {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(ResolvedStep::id).collect()
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step.id == step_id)
    }

    pub fn fingerprint_of(category: Category, steps: &[ResolvedStep]) -> Fingerprint {
        let lines = std::iter::once(format!("category:{}", category.as_str())).chain(
            steps.iter().map(|s| {
                format!("{}:{}:{}", s.step.id, s.template.name, s.template.version)
            }),
        );
        Fingerprint::compute(lines)
    }
}

#[derive(Debug, Clone)]
pub struct StepRegistry {
    base: Vec<PromptStep>,
    category_steps: BTreeMap<Category, Vec<PromptStep>>,
    catalog: TemplateCatalog,
}

impl StepRegistry {
    pub fn new(
        base: Vec<PromptStep>,
        category_steps: BTreeMap<Category, Vec<PromptStep>>,
        catalog: TemplateCatalog,
    ) -> Self {
        Self {
            base,
            category_steps,
            catalog,
        }
    }

    /// Twelve base steps plus two steps for every category except generic.
    pub fn builtin() -> Self {
        Self::with_catalog(TemplateCatalog::builtin())
    }

    pub fn with_catalog(catalog: TemplateCatalog) -> Self {
        let base = vec![
            PromptStep::base("overview", &[]),
            PromptStep::base("dependencies", &["overview"]),
            PromptStep::base("code_structure", &["overview"]),
            PromptStep::base("api_surface", &["code_structure"]),
            PromptStep::base("database", &["code_structure", "dependencies"]),
            PromptStep::base("events_and_messaging", &["code_structure"]),
            PromptStep::base("external_services", &["dependencies", "api_surface"]),
            PromptStep::base("authentication", &["api_surface"]),
            PromptStep::base("security", &["authentication", "dependencies", "database"]),
            PromptStep::base("configuration", &["code_structure"]),
            PromptStep::base("deployment", &["configuration", "dependencies"]),
            PromptStep::base("monitoring", &["deployment", "external_services"]),
        ];

        use Category::*;
        let mut category_steps = BTreeMap::new();
        category_steps.insert(
            Backend,
            vec![
                PromptStep::for_category(Backend, "service_architecture", &["code_structure", "api_surface"]),
                PromptStep::for_category(Backend, "data_flow", &["service_architecture", "database"]),
            ],
        );
        category_steps.insert(
            Frontend,
            vec![
                PromptStep::for_category(Frontend, "ui_components", &["code_structure"]),
                PromptStep::for_category(Frontend, "state_management", &["ui_components", "api_surface"]),
            ],
        );
        category_steps.insert(
            Libraries,
            vec![
                PromptStep::for_category(Libraries, "public_api", &["api_surface"]),
                PromptStep::for_category(Libraries, "versioning_and_compat", &["public_api", "dependencies"]),
            ],
        );
        category_steps.insert(
            InfraAsCode,
            vec![
                PromptStep::for_category(InfraAsCode, "resource_inventory", &["code_structure"]),
                PromptStep::for_category(InfraAsCode, "environment_topology", &["resource_inventory", "deployment"]),
            ],
        );
        category_steps.insert(Generic, Vec::new());

        Self::new(base, category_steps, catalog)
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn base_steps(&self) -> &[PromptStep] {
        &self.base
    }

    pub fn category_steps(&self, category: Category) -> &[PromptStep] {
        self.category_steps
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether any category's pipeline contains `step_id`.
    pub fn contains_step(&self, step_id: &str) -> bool {
        self.base
            .iter()
            .chain(self.category_steps.values().flatten())
            .any(|s| s.id == step_id)
    }

    /// Build the pipeline for every category, failing on the first error.
    pub fn validate_all(&self) -> Result<(), PipelineError> {
        for category in Category::PRIORITY {
            self.build_pipeline(category)?;
        }
        Ok(())
    }

    pub fn build_pipeline(&self, category: Category) -> Result<PromptPipeline, PipelineError> {
        let steps: Vec<&PromptStep> = self
            .base
            .iter()
            .chain(self.category_steps(category))
            .collect();

        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (idx, step) in steps.iter().enumerate() {
            if positions.insert(step.id.as_str(), idx).is_some() {
                return Err(PipelineError::DuplicateStep {
                    step: step.id.clone(),
                });
            }
        }

        for step in &steps {
            for dep in &step.depends_on {
                if !positions.contains_key(dep.as_str()) {
                    return Err(PipelineError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(path) = find_cycle(&steps) {
            return Err(PipelineError::Cycle { path });
        }

        for (idx, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                if positions[dep.as_str()] >= idx {
                    return Err(PipelineError::ForwardReference {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut resolved = Vec::with_capacity(steps.len());
        for step in steps {
            let template = self.catalog.get(&step.template).ok_or_else(|| {
                PipelineError::MissingTemplate {
                    step: step.id.clone(),
                    template: step.template.clone(),
                }
            })?;
            resolved.push(ResolvedStep {
                step: step.clone(),
                template: template.clone(),
            });
        }

        let fingerprint = PromptPipeline::fingerprint_of(category, &resolved);
        Ok(PromptPipeline {
            category,
            steps: resolved,
            fingerprint,
        })
    }
}

/// Depth-first search for a dependency cycle; returns the closed path.
fn find_cycle(steps: &[&PromptStep]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
        .collect();
    let mut done: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        stack: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(start) = stack.iter().position(|n| *n == node) {
            let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
            path.push(node.to_string());
            return Some(path);
        }
        if done.contains(node) {
            return None;
        }
        stack.push(node);
        for dep in deps.get(node).copied().unwrap_or(&[]) {
            if let Some(path) = visit(dep.as_str(), deps, stack, done) {
                return Some(path);
            }
        }
        stack.pop();
        done.insert(node);
        None
    }

    for step in steps {
        let mut stack = Vec::new();
        if let Some(path) = visit(step.id.as_str(), &deps, &mut stack, &mut done) {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(base: Vec<PromptStep>) -> StepRegistry {
        let mut catalog = TemplateCatalog::new();
        for step in &base {
            catalog.insert(Template {
                name: step.template.clone(),
                version: 1,
                body: "body".into(),
            });
        }
        StepRegistry::new(base, BTreeMap::new(), catalog)
    }

    #[test]
    fn builtin_pipelines_have_expected_sizes() {
        let reg = StepRegistry::builtin();
        reg.validate_all().unwrap();
        for (category, len) in [
            (Category::Libraries, 14),
            (Category::Backend, 14),
            (Category::Frontend, 14),
            (Category::InfraAsCode, 14),
            (Category::Generic, 12),
        ] {
            assert_eq!(reg.build_pipeline(category).unwrap().len(), len);
        }
    }

    #[test]
    fn base_steps_come_first_in_declared_order() {
        let p = StepRegistry::builtin().build_pipeline(Category::Libraries).unwrap();
        let ids = p.step_ids();
        assert_eq!(ids[0], "overview");
        assert_eq!(ids[11], "monitoring");
        assert_eq!(&ids[12..], &["public_api", "versioning_and_compat"]);
    }

    #[test]
    fn fingerprint_tracks_category_and_versions() {
        let reg = StepRegistry::builtin();
        let lib = reg.build_pipeline(Category::Libraries).unwrap();
        let lib_again = reg.build_pipeline(Category::Libraries).unwrap();
        let backend = reg.build_pipeline(Category::Backend).unwrap();
        assert_eq!(lib.fingerprint, lib_again.fingerprint);
        assert_ne!(lib.fingerprint, backend.fingerprint);

        let mut catalog = TemplateCatalog::builtin();
        catalog.insert(Template {
            name: "security".into(),
            version: 2,
            body: "v2".into(),
        });
        let bumped = StepRegistry::with_catalog(catalog)
            .build_pipeline(Category::Libraries)
            .unwrap();
        assert_ne!(lib.fingerprint, bumped.fingerprint);
    }

    #[test]
    fn cycle_is_rejected() {
        let reg = registry(vec![
            PromptStep::base("a", &["c"]),
            PromptStep::base("b", &["a"]),
            PromptStep::base("c", &["b"]),
        ]);
        let err = reg.build_pipeline(Category::Generic).unwrap_err();
        match err {
            PipelineError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let reg = registry(vec![PromptStep::base("a", &["a"])]);
        assert!(matches!(
            reg.build_pipeline(Category::Generic),
            Err(PipelineError::Cycle { .. })
        ));
    }

    #[test]
    fn forward_reference_is_rejected() {
        let reg = registry(vec![PromptStep::base("a", &["b"]), PromptStep::base("b", &[])]);
        assert_eq!(
            reg.build_pipeline(Category::Generic).unwrap_err(),
            PipelineError::ForwardReference {
                step: "a".into(),
                dependency: "b".into()
            }
        );
    }

    #[test]
    fn unknown_dependency_and_duplicates() {
        let reg = registry(vec![PromptStep::base("a", &["ghost"])]);
        assert!(matches!(
            reg.build_pipeline(Category::Generic),
            Err(PipelineError::UnknownDependency { .. })
        ));

        let reg = registry(vec![PromptStep::base("a", &[]), PromptStep::base("a", &[])]);
        assert!(matches!(
            reg.build_pipeline(Category::Generic),
            Err(PipelineError::DuplicateStep { .. })
        ));
    }

    #[test]
    fn missing_template_is_rejected() {
        let reg = StepRegistry::new(
            vec![PromptStep::base("a", &[])],
            BTreeMap::new(),
            TemplateCatalog::new(),
        );
        assert!(matches!(
            reg.build_pipeline(Category::Generic),
            Err(PipelineError::MissingTemplate { .. })
        ));
    }

    #[test]
    fn contains_step_covers_category_steps() {
        let reg = StepRegistry::builtin();
        assert!(reg.contains_step("security"));
        assert!(reg.contains_step("public_api"));
        assert!(!reg.contains_step("nonexistent"));
    }
}
