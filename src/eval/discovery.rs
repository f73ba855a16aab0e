//! Finding and filtering task files.

use std::path::{Component, Path, PathBuf};

use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use super::assertions::TaskAssertions;
use super::config::{matches_label_selector, EvalSpec, TaskSet};
use super::EvalError;
use crate::task::TaskConfig;

/// A task selected for the run.
#[derive(Debug, Clone)]
pub struct DiscoveredTask {
    pub path: PathBuf,
    pub config: TaskConfig,
    pub assertions: Option<TaskAssertions>,
}

/// Loads every task of every task set, in task set order and sorted by path
/// within a glob.
///
/// Documents of another kind are skipped. Any other load error aborts
/// discovery.
pub fn discover_tasks(spec: &EvalSpec, name_filter: &Regex) -> Result<Vec<DiscoveredTask>, EvalError> {
    let mut tasks = Vec::new();

    for set in &spec.config.task_sets {
        for path in task_set_paths(set)? {
            let config = match TaskConfig::from_file(&path) {
                Ok(cfg) => cfg,
                Err(e) if e.is_wrong_kind() => {
                    debug!(path = %path.display(), "Skipping non-task document");
                    continue;
                }
                Err(source) => {
                    return Err(EvalError::LoadTask {
                        path: path.display().to_string(),
                        source,
                    })
                }
            };

            if !name_filter.is_match(config.name()) {
                continue;
            }
            if !matches_label_selector(&config.metadata.labels, &set.label_selector) {
                continue;
            }

            tasks.push(DiscoveredTask {
                path,
                config,
                assertions: set.assertions.clone(),
            });
        }
    }

    Ok(tasks)
}

fn task_set_paths(set: &TaskSet) -> Result<Vec<PathBuf>, EvalError> {
    match (&set.glob, &set.path) {
        (Some(pattern), _) => glob(pattern),
        (None, Some(path)) => Ok(vec![PathBuf::from(path)]),
        (None, None) => Ok(Vec::new()),
    }
}

/// Expands a glob pattern into the matching files, sorted.
pub fn glob(pattern: &str) -> Result<Vec<PathBuf>, EvalError> {
    let re = glob_to_regex(pattern).map_err(|source| EvalError::Glob {
        pattern: pattern.to_string(),
        source,
    })?;

    let root = literal_prefix(Path::new(pattern));
    if !root.exists() {
        return Ok(Vec::new());
    }
    if root.is_file() {
        return Ok(if re.is_match(&root.to_string_lossy()) {
            vec![root]
        } else {
            Vec::new()
        });
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry during glob");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            // Relative patterns walk from "." but must match without it.
            let rel = path.strip_prefix(".").unwrap_or(path);
            re.is_match(&rel.to_string_lossy())
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// The leading components of `pattern` that contain no glob syntax.
fn literal_prefix(pattern: &Path) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in pattern.components() {
        if let Component::Normal(part) = component {
            if part.to_string_lossy().contains(&['*', '?', '['][..]) {
                break;
            }
        }
        prefix.push(component);
    }
    if prefix.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        prefix
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    re.push_str("(?:.*/)?");
                } else {
                    re.push_str(".*");
                }
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    re.push('^');
                }
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    if c == '\\' {
                        re.push('\\');
                    }
                    re.push(c);
                }
                re.push(']');
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }

    re.push('$');
    Regex::new(&re)
}
