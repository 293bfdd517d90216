//! Prompt inputs derived from a scanned tree: an indented directory listing
//! and the collected dependency manifests.

use std::collections::BTreeMap;

use crate::classify::FileTree;

/// Levels listed in full; deeper directories are shown as `[NESTED]`.
pub const STRUCTURE_DEPTH: usize = 3;

/// Characters of each manifest included in the dependency section.
pub const MANIFEST_CHAR_LIMIT: usize = 8_000;

pub const NO_DEPENDENCIES: &str = "No dependency files found!";

#[derive(Default)]
struct Node {
    dirs: BTreeMap<String, Node>,
    files: Vec<String>,
}

impl Node {
    fn insert(&mut self, path: &str) {
        let mut node = self;
        let mut parts = path.split('/').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                node.files.push(part.to_string());
            } else {
                node = node.dirs.entry(part.to_string()).or_default();
            }
        }
    }

    fn ensure_dir(&mut self, path: &str) {
        let mut node = self;
        for part in path.split('/') {
            node = node.dirs.entry(part.to_string()).or_default();
        }
    }
}

/// Render the directory listing of `tree`, headed by the repository name.
pub fn render_structure(repo_name: &str, tree: &FileTree, max_depth: usize) -> String {
    let mut root = Node::default();
    for dir in tree.dirs() {
        root.ensure_dir(dir);
    }
    for file in tree.files() {
        root.insert(file);
    }

    let header = format!("Repository: {repo_name}");
    let mut lines = vec![header.clone(), "=".repeat(header.len()), String::new()];
    render_node(&root, 0, max_depth, &mut lines);
    lines.join("\n")
}

fn render_node(node: &Node, level: usize, max_depth: usize, out: &mut Vec<String>) {
    let indent = "  ".repeat(level + 1);
    let mut files = node.files.clone();
    files.sort();

    if level >= max_depth {
        for name in node.dirs.keys() {
            out.push(format!("{indent}{name}/ [NESTED]"));
        }
        if !files.is_empty() {
            out.push(format!("{indent}[{} files]", files.len()));
        }
        return;
    }

    for file in &files {
        out.push(format!("{indent}{file}"));
    }
    for (name, child) in &node.dirs {
        out.push(format!("{indent}{name}/"));
        render_node(child, level + 1, max_depth, out);
    }
}

fn ecosystem(file_name: &str) -> &'static str {
    match file_name {
        "pyproject.toml" | "setup.py" | "setup.cfg" | "Pipfile" | "environment.yml" => "Python",
        "package.json" | "bower.json" | "lerna.json" => "JavaScript",
        "Gemfile" => "Ruby",
        "go.mod" | "Gopkg.toml" => "Go",
        "Cargo.toml" => "Rust",
        "pom.xml" | "build.gradle" | "build.gradle.kts" | "settings.gradle" => "Java",
        "packages.config" | "Directory.Build.props" => "C#",
        "composer.json" => "PHP",
        name if name.starts_with("requirements") => "Python",
        name if name.ends_with(".gemspec") => "Ruby",
        name if name.ends_with(".csproj") => "C#",
        _ => "Other",
    }
}

/// Dependency manifests grouped by ecosystem, each in a fenced block.
pub fn render_dependencies(tree: &FileTree) -> String {
    let mut by_ecosystem: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
    for (path, content) in tree.manifests() {
        let name = path.rsplit('/').next().unwrap_or(path);
        by_ecosystem
            .entry(ecosystem(name))
            .or_default()
            .push((path, content));
    }
    if by_ecosystem.is_empty() {
        return NO_DEPENDENCIES.to_string();
    }

    let mut out = vec!["## Dependencies".to_string(), String::new()];
    for (eco, files) in by_ecosystem {
        out.push(format!("### {eco}"));
        out.push(String::new());
        for (path, content) in files {
            out.push(format!("**File:** `{path}`"));
            out.push("```".to_string());
            out.push(truncate_chars(content, MANIFEST_CHAR_LIMIT).to_string());
            out.push("```".to_string());
            out.push(String::new());
        }
    }
    out.join("\n")
}

fn truncate_chars(s: &str, limit: usize) -> &str {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_lists_files_then_dirs() {
        let tree = FileTree::from_paths(["README.md", "src/main.rs", "src/api/routes.rs"]);
        let out = render_structure("svc", &tree, STRUCTURE_DEPTH);
        let expected = "Repository: svc\n===============\n\n  README.md\n  src/\n    main.rs\n    api/\n      routes.rs";
        assert_eq!(out, expected);
    }

    #[test]
    fn deep_directories_are_nested() {
        let tree = FileTree::from_paths(["a/b/c/d/e.txt", "a/b/c/f.txt"]);
        let out = render_structure("deep", &tree, 3);
        assert!(out.contains("d/ [NESTED]"));
        assert!(out.contains("[1 files]"));
        assert!(!out.contains("e.txt"));
    }

    #[test]
    fn dependencies_grouped_by_ecosystem() {
        let tree = FileTree::default()
            .with_content("package.json", r#"{"dependencies":{}}"#)
            .with_content("api/requirements.txt", "flask==3.0");
        let out = render_dependencies(&tree);
        let js = out.find("### JavaScript").unwrap();
        let py = out.find("### Python").unwrap();
        assert!(js < py);
        assert!(out.contains("**File:** `api/requirements.txt`"));
    }

    #[test]
    fn no_manifests_has_placeholder() {
        let tree = FileTree::from_paths(["README.md"]);
        assert_eq!(render_dependencies(&tree), NO_DEPENDENCIES);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
