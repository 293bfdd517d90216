//! Type classifier: resolves a repository category from its file tree.
//!
//! Each scored category accumulates four weighted signals:
//!
//! | signal | weight |
//! |--------|--------|
//! | file name patterns | 0.50 |
//! | directory structure | 0.30 |
//! | dependency manifest keywords | 0.15 |
//! | source keywords | 0.05 |
//!
//! A signal reaches its full weight after a few distinct matches (see
//! [`patterns::SATURATION`]). A strong marker file lifts the category to at
//! least [`STRONG_MARKER_FLOOR`], and boosted categories are considered before
//! unboosted ones. Within a group the first category in
//! [`Category::PRIORITY`] order whose total clears the threshold wins;
//! otherwise the repository is `generic`.

pub mod patterns;
pub mod tree;

use serde::{Deserialize, Serialize};

use crate::domain::{Category, ClassifyError};
use patterns::{CompiledPatterns, SATURATION};
pub use tree::{FileTree, ScanConfig};

pub const FILE_WEIGHT: f64 = 0.50;
pub const DIR_WEIGHT: f64 = 0.30;
pub const MANIFEST_WEIGHT: f64 = 0.15;
pub const SOURCE_WEIGHT: f64 = 0.05;

pub const DEFAULT_THRESHOLD: f64 = 0.15;
pub const STRONG_MARKER_FLOOR: f64 = 0.6;

/// Weighted score of one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub category: Category,
    pub file_score: f64,
    pub dir_score: f64,
    pub manifest_score: f64,
    pub source_score: f64,
    /// A strong marker matched.
    pub boosted: bool,
    pub total: f64,
    /// Patterns and keywords that contributed, for diagnostics.
    pub matched: Vec<String>,
}

/// Per-category breakdown plus confidence in the chosen category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationScore {
    /// Scored categories in priority order. Empty when an override was used.
    pub breakdown: Vec<CategoryScore>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Override,
    Scored,
    /// No category cleared the threshold.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub score: ClassificationScore,
    pub source: ClassificationSource,
}

pub struct TypeClassifier {
    patterns: &'static [CompiledPatterns],
    threshold: f64,
}

impl Default for TypeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeClassifier {
    pub fn new() -> Self {
        Self {
            patterns: patterns::compiled(),
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Resolve the category of `tree`.
    ///
    /// An override bypasses scoring entirely; an unknown override name is a
    /// configuration error. Without an override an empty tree is rejected.
    pub fn classify(
        &self,
        tree: &FileTree,
        category_override: Option<&str>,
    ) -> Result<Classification, ClassifyError> {
        if let Some(name) = category_override {
            let category = Category::parse(name)?;
            return Ok(Classification {
                category,
                score: ClassificationScore {
                    breakdown: Vec::new(),
                    confidence: 1.0,
                },
                source: ClassificationSource::Override,
            });
        }

        if tree.is_empty() {
            return Err(ClassifyError::EmptyTree {
                path: tree
                    .root()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<in-memory>".to_string()),
            });
        }

        let breakdown = self.score_all(tree);
        let winner = breakdown
            .iter()
            .filter(|s| s.boosted)
            .chain(breakdown.iter().filter(|s| !s.boosted))
            .find(|s| s.total >= self.threshold)
            .map(|s| (s.category, s.total));

        let (category, confidence, source) = match winner {
            Some((category, total)) => (category, total, ClassificationSource::Scored),
            None => (Category::Generic, 0.0, ClassificationSource::Fallback),
        };

        Ok(Classification {
            category,
            score: ClassificationScore {
                breakdown,
                confidence,
            },
            source,
        })
    }

    /// Scores for every pattern table, in priority order.
    pub fn score_all(&self, tree: &FileTree) -> Vec<CategoryScore> {
        let manifest_text: String = tree
            .manifests()
            .map(|(_, content)| content.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join("\n");
        let files: Vec<&str> = tree.files().collect();
        let dirs: Vec<&str> = tree.dirs().collect();

        let mut scores: Vec<CategoryScore> = self
            .patterns
            .iter()
            .map(|p| score_category(p, &files, &dirs, &manifest_text, tree))
            .collect();
        scores.sort_by_key(|s| priority_rank(s.category));
        scores
    }
}

fn priority_rank(category: Category) -> usize {
    Category::PRIORITY
        .iter()
        .position(|c| *c == category)
        .unwrap_or(Category::PRIORITY.len())
}

fn saturate(hits: usize, cap: usize, weight: f64) -> f64 {
    if cap == 0 {
        return 0.0;
    }
    (hits.min(cap) as f64 / cap as f64) * weight
}

fn score_category(
    compiled: &CompiledPatterns,
    files: &[&str],
    dirs: &[&str],
    manifest_text: &str,
    tree: &FileTree,
) -> CategoryScore {
    let table = &compiled.table;
    let mut matched = Vec::new();

    let file_hits = compiled
        .matched_files(files)
        .into_iter()
        .inspect(|pat| matched.push(format!("file:{pat}")))
        .count();

    let dir_hits = table
        .dirs
        .iter()
        .filter(|pat| dirs.iter().any(|d| patterns::dir_pattern_matches(pat, d)))
        .inspect(|pat| matched.push(format!("dir:{pat}")))
        .count();

    let manifest_hits = table
        .manifest_keywords
        .iter()
        .filter(|kw| manifest_text.contains(&kw.to_ascii_lowercase()))
        .inspect(|kw| matched.push(format!("manifest:{kw}")))
        .count();

    let source_hits = table
        .source_keywords
        .iter()
        .filter(|kw| tree.source_samples().any(|(_, body)| body.contains(*kw)))
        .inspect(|kw| matched.push(format!("source:{kw}")))
        .count();

    let boosted = compiled
        .matched_markers(files)
        .into_iter()
        .inspect(|pat| matched.push(format!("marker:{pat}")))
        .count()
        > 0;

    let file_score = saturate(file_hits, SATURATION.files, FILE_WEIGHT);
    let dir_score = saturate(dir_hits, SATURATION.dirs, DIR_WEIGHT);
    let manifest_score = saturate(manifest_hits, SATURATION.manifest, MANIFEST_WEIGHT);
    let source_score = saturate(source_hits, SATURATION.source, SOURCE_WEIGHT);

    let mut total = file_score + dir_score + manifest_score + source_score;
    if boosted {
        total = total.max(STRONG_MARKER_FLOOR);
    }

    CategoryScore {
        category: table.category,
        file_score,
        dir_score,
        manifest_score,
        source_score,
        boosted,
        total: total.min(1.0),
        matched,
    }
}
