//! Build-context exclude rules
//!
//! `.dockerignore` 形式のパターンを解釈します。後に書かれたルールが優先され、
//! `!` で始まるルールは除外を取り消します。

use glob::{MatchOptions, Pattern};
use std::io::ErrorKind;
use std::path::Path;

pub const DEFAULT_IGNORE_FILE: &str = ".dockerignore";

/// Project configuration file, never part of a build context
pub const PROJECT_CONFIG_FILE: &str = "shipyard.toml";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct Rule {
    raw: String,
    pattern: Pattern,
    negated: bool,
}

impl Rule {
    fn parse(line: &str) -> Option<Rule> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (negated, body) = match line.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, line),
        };

        let cleaned = clean_pattern(body);
        if cleaned.is_empty() {
            return None;
        }

        match Pattern::new(&cleaned) {
            Ok(pattern) => Some(Rule {
                raw: if negated {
                    format!("!{}", cleaned)
                } else {
                    cleaned
                },
                pattern,
                negated,
            }),
            Err(e) => {
                tracing::warn!("Ignoring invalid exclude pattern '{}': {}", line, e);
                None
            }
        }
    }

    /// The rule applies to `path` itself or to one of its parent directories
    fn applies_to(&self, path: &str) -> bool {
        if self.pattern.matches_with(path, MATCH_OPTIONS) {
            return true;
        }

        path.match_indices('/')
            .any(|(idx, _)| self.pattern.matches_with(&path[..idx], MATCH_OPTIONS))
    }
}

fn clean_pattern(pattern: &str) -> String {
    let parts: Vec<&str> = pattern
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    parts.join("/")
}

/// Ordered exclude rules for a build context
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    rules: Vec<Rule>,
}

impl ExcludeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse ignore-file content, one pattern per line
    pub fn parse(content: &str) -> Self {
        let mut set = Self::new();
        for line in content.lines() {
            set.push(line);
        }
        set
    }

    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for pattern in patterns {
            set.push(pattern.as_ref());
        }
        set
    }

    pub fn push(&mut self, pattern: &str) {
        if let Some(rule) = Rule::parse(pattern) {
            self.rules.push(rule);
        }
    }

    pub fn extend(&mut self, other: ExcludeSet) {
        self.rules.extend(other.rules);
    }

    pub fn patterns(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.raw.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn has_negations(&self) -> bool {
        self.rules.iter().any(|r| r.negated)
    }

    /// Whether `path` (relative to the context root) is excluded.
    /// The last matching rule wins.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            return false;
        }

        let mut excluded = false;
        for rule in &self.rules {
            if rule.applies_to(&normalized) {
                excluded = !rule.negated;
            }
        }
        excluded
    }
}

fn normalize_path(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("/")
}

/// コンテキストディレクトリの除外ルールを読み込む
///
/// - ignore ファイルが存在しない場合は暗黙のルールのみ
/// - 読み込めない場合は警告を出して空のルールで続行
/// - ignore ファイル自身とレシピが除外される場合は取り消しルールを追加
pub fn load_excludes(context_dir: &Path, ignore_file: Option<&Path>, recipe_name: &str) -> ExcludeSet {
    let ignore_path = ignore_file
        .map(|p| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                context_dir.join(p)
            }
        })
        .unwrap_or_else(|| context_dir.join(DEFAULT_IGNORE_FILE));

    let mut set = ExcludeSet::new();
    set.push(&Pattern::escape(PROJECT_CONFIG_FILE));

    match std::fs::read_to_string(&ignore_path) {
        Ok(content) => {
            tracing::debug!("Loaded exclude rules from {}", ignore_path.display());
            set.extend(ExcludeSet::parse(&content));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!("No ignore file at {}", ignore_path.display());
            return set;
        }
        Err(e) => {
            tracing::warn!(
                "Could not read {}: {}. Continuing without exclude rules.",
                ignore_path.display(),
                e
            );
            return set;
        }
    }

    if let Ok(relative) = ignore_path.strip_prefix(context_dir)
        && set.is_excluded(relative)
    {
        set.push(&format!("!{}", Pattern::escape(&normalize_path(relative))));
    }

    if set.is_excluded(Path::new(recipe_name)) {
        if recipe_name.eq_ignore_ascii_case("dockerfile") {
            set.push("![Dd]ockerfile");
        } else {
            set.push(&format!("!{}", Pattern::escape(recipe_name)));
        }
    }

    set
}
