//! Category pattern tables and matching primitives.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::domain::Category;

/// Signals that indicate one category.
#[derive(Debug, Clone)]
pub struct CategoryPatterns {
    pub category: Category,
    /// File globs. A pattern containing `/` matches a relative path suffix
    /// instead of the base name.
    pub files: &'static [&'static str],
    /// Directory names, or `/`-joined suffixes such as `src/components`.
    pub dirs: &'static [&'static str],
    /// Lowercase substrings searched in dependency manifests.
    pub manifest_keywords: &'static [&'static str],
    /// Substrings searched in sampled source files.
    pub source_keywords: &'static [&'static str],
    /// File globs that alone lift the score to the boost floor.
    pub strong_markers: &'static [&'static str],
}

/// Distinct matches needed for a signal to reach its full weight.
#[derive(Debug, Clone, Copy)]
pub struct Saturation {
    pub files: usize,
    pub dirs: usize,
    pub manifest: usize,
    pub source: usize,
}

pub const SATURATION: Saturation = Saturation {
    files: 4,
    dirs: 3,
    manifest: 3,
    source: 3,
};

/// Directory matches only count this close to the root.
pub const MAX_DIR_DEPTH: usize = 3;

pub fn builtin() -> Vec<CategoryPatterns> {
    vec![
        CategoryPatterns {
            category: Category::InfraAsCode,
            files: &[
                "*.tf",
                "*.tfvars",
                "*.hcl",
                "Pulumi.*.yaml",
                "serverless.yml",
                "template.yaml",
                "playbook.yml",
                "site.yml",
                "values.yaml",
                "Chart.yaml",
                "kustomization.yaml",
                "cdk.json",
            ],
            dirs: &[
                "terraform",
                "modules",
                "environments",
                "envs",
                "ansible",
                "roles",
                "playbooks",
                "charts",
                "helm",
                "k8s",
                "kubernetes",
                "manifests",
                "stacks",
            ],
            manifest_keywords: &["aws-cdk-lib", "@pulumi/", "cdktf", "troposphere", "pulumi"],
            source_keywords: &["resource \"", "provider \"", "module \"", "kind: Deployment"],
            strong_markers: &[
                "main.tf",
                "terragrunt.hcl",
                "Pulumi.yaml",
                "cdk.json",
                "ansible.cfg",
                "Chart.yaml",
                "kustomization.yaml",
                "helmfile.yaml",
            ],
        },
        CategoryPatterns {
            category: Category::Libraries,
            files: &[
                "LICENSE*",
                "index.d.ts",
                ".npmignore",
                "*.gemspec",
                "rollup.config.*",
                "tsup.config.*",
                "src/lib.rs",
                "MANIFEST.in",
            ],
            dirs: &["lib", "docs", "examples", "benchmarks", "benches"],
            manifest_keywords: &[
                "\"files\":",
                "\"exports\":",
                "\"peerdependencies\":",
                "\"types\":",
                "\"typings\":",
                "[lib]",
                "gem::specification",
            ],
            source_keywords: &["module.exports", "export default", "pub fn ", "__all__"],
            strong_markers: &[".npmignore", "*.gemspec", "MANIFEST.in"],
        },
        CategoryPatterns {
            category: Category::Frontend,
            files: &[
                "index.html",
                "vite.config.*",
                "webpack.config.*",
                "angular.json",
                "next.config.*",
                "nuxt.config.*",
                "svelte.config.*",
                "tailwind.config.*",
                "*.tsx",
                "*.jsx",
                "*.vue",
                "*.svelte",
            ],
            dirs: &[
                "components",
                "src/components",
                "pages",
                "public",
                "assets",
                "styles",
                "static",
                "hooks",
            ],
            manifest_keywords: &[
                "\"react\"",
                "\"vue\"",
                "@angular/core",
                "\"svelte\"",
                "\"next\"",
                "\"nuxt\"",
                "\"vite\"",
            ],
            source_keywords: &["useState", "React.", "<template>", "document.", "window."],
            strong_markers: &[
                "angular.json",
                "next.config.js",
                "next.config.mjs",
                "nuxt.config.ts",
                "nuxt.config.js",
                "svelte.config.js",
                "vite.config.ts",
                "vite.config.js",
            ],
        },
        CategoryPatterns {
            category: Category::Backend,
            files: &[
                "manage.py",
                "app.py",
                "main.py",
                "server.js",
                "app.js",
                "main.go",
                "Procfile",
                "Dockerfile",
                "docker-compose.y*ml",
                "application.properties",
                "application.y*ml",
                "wsgi.py",
                "asgi.py",
                "*.sql",
            ],
            dirs: &[
                "api",
                "routes",
                "controllers",
                "handlers",
                "services",
                "models",
                "migrations",
                "cmd",
                "internal",
                "server",
            ],
            manifest_keywords: &[
                "express",
                "fastify",
                "django",
                "flask",
                "fastapi",
                "spring-boot",
                "gin-gonic",
                "actix-web",
                "axum",
                "rails",
                "sqlalchemy",
                "koa",
                "@nestjs/core",
            ],
            source_keywords: &[
                "@app.route",
                "app.get(",
                "router.",
                "http.HandleFunc",
                "@RestController",
                "#[get(",
                ".listen(",
            ],
            strong_markers: &["manage.py", "wsgi.py", "asgi.py", "application.properties"],
        },
    ]
}

/// A category table with its file globs compiled.
#[derive(Debug)]
pub struct CompiledPatterns {
    pub table: CategoryPatterns,
    files: GlobSet,
    strong_markers: GlobSet,
}

impl CompiledPatterns {
    pub fn compile(table: CategoryPatterns) -> Result<Self, globset::Error> {
        Ok(Self {
            files: build_globset(table.files)?,
            strong_markers: build_globset(table.strong_markers)?,
            table,
        })
    }

    /// Distinct file patterns matched by any path, in table order.
    pub fn matched_files(&self, paths: &[&str]) -> Vec<&'static str> {
        matched(&self.files, self.table.files, paths)
    }

    pub fn matched_markers(&self, paths: &[&str]) -> Vec<&'static str> {
        matched(&self.strong_markers, self.table.strong_markers, paths)
    }
}

static BUILTIN: LazyLock<Vec<CompiledPatterns>> = LazyLock::new(|| {
    builtin()
        .into_iter()
        .map(CompiledPatterns::compile)
        .collect::<Result<_, _>>()
        .expect("builtin file patterns are valid")
});

/// The builtin tables, compiled once per process.
pub fn compiled() -> &'static [CompiledPatterns] {
    &BUILTIN
}

/// Bare names match at any depth; `src/lib.rs` matches that path suffix.
fn build_globset(patterns: &[&str]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            GlobBuilder::new(&format!("**/{pattern}"))
                .literal_separator(true)
                .build()?,
        );
    }
    builder.build()
}

fn matched(set: &GlobSet, patterns: &[&'static str], paths: &[&str]) -> Vec<&'static str> {
    let hits: BTreeSet<usize> = paths.iter().flat_map(|p| set.matches(p)).collect();
    hits.into_iter().map(|i| patterns[i]).collect()
}

pub fn dir_pattern_matches(pattern: &str, dir: &str) -> bool {
    if dir.split('/').count() > MAX_DIR_DEPTH {
        return false;
    }
    dir == pattern || dir.ends_with(&format!("/{pattern}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files_matching(patterns: &'static [&'static str], paths: &[&str]) -> Vec<&'static str> {
        let compiled = CompiledPatterns::compile(CategoryPatterns {
            category: Category::Generic,
            files: patterns,
            dirs: &[],
            manifest_keywords: &[],
            source_keywords: &[],
            strong_markers: &[],
        })
        .unwrap();
        compiled.matched_files(paths)
    }

    #[test]
    fn name_globs_match_at_any_depth() {
        assert_eq!(files_matching(&["*.tf"], &["main.tf", "modules/vpc/main.tf"]), vec!["*.tf"]);
        assert!(files_matching(&["*.tf"], &["main.tfvars"]).is_empty());
        assert_eq!(files_matching(&["LICENSE*"], &["LICENSE.md"]), vec!["LICENSE*"]);
        assert_eq!(
            files_matching(&["docker-compose.y*ml"], &["deploy/docker-compose.yml"]),
            vec!["docker-compose.y*ml"]
        );
        assert_eq!(
            files_matching(&["Pulumi.*.yaml"], &["Pulumi.dev.yaml"]),
            vec!["Pulumi.*.yaml"]
        );
        assert!(files_matching(&["index.html"], &["index.htm"]).is_empty());
    }

    #[test]
    fn path_globs_match_suffixes_only() {
        let pats: &'static [&'static str] = &["src/lib.rs"];
        assert_eq!(files_matching(pats, &["src/lib.rs"]), vec!["src/lib.rs"]);
        assert_eq!(files_matching(pats, &["crates/foo/src/lib.rs"]), vec!["src/lib.rs"]);
        assert!(files_matching(pats, &["lib.rs"]).is_empty());
        assert!(files_matching(pats, &["mysrc/lib.rs"]).is_empty());
    }

    #[test]
    fn each_pattern_counts_once() {
        let hits = files_matching(&["*.tf", "*.hcl", "*.tfvars"], &["a.tf", "b.tf", "c.hcl"]);
        assert_eq!(hits, vec!["*.tf", "*.hcl"]);
    }

    #[test]
    fn dir_patterns_respect_depth() {
        assert!(dir_pattern_matches("api", "api"));
        assert!(dir_pattern_matches("components", "src/components"));
        assert!(dir_pattern_matches("src/components", "web/src/components"));
        assert!(!dir_pattern_matches("api", "a/b/c/api"));
        assert!(!dir_pattern_matches("api", "rapid"));
    }

    #[test]
    fn every_scored_category_has_patterns() {
        let tables = builtin();
        assert_eq!(tables.len(), 4);
        assert_eq!(compiled().len(), 4);
        assert!(!tables.iter().any(|t| t.category == Category::Generic));
        for t in &tables {
            assert!(!t.files.is_empty());
            assert!(!t.strong_markers.is_empty());
        }
    }
}
