//! Path discovery for runners
//!
//! Resolves a runner's include/ignore patterns, rooted at its base directory,
//! into the concrete set of files (and their parent directories) to hand to the
//! filesystem watcher. Patterns are regular expressions tested against the file
//! path relative to the matcher root, using `/` as separator. `ignore` always
//! wins over `include`.

use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{resolve_path, Matcher};
use crate::{Error, Result};

/// A single matcher with its patterns compiled
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
    include: Option<Regex>,
    ignore: Option<Regex>,
}

impl CompiledMatcher {
    /// Compile a matcher; an invalid pattern is a configuration error
    pub fn compile(matcher: &Matcher) -> Result<Self> {
        Ok(Self {
            include: compile_pattern(&matcher.include)?,
            ignore: compile_pattern(&matcher.ignore)?,
        })
    }

    /// `relative` satisfies `include` (or include is empty) and not `ignore`
    pub fn is_match(&self, relative: &str) -> bool {
        if let Some(ignore) = &self.ignore {
            if ignore.is_match(relative) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(relative),
            None => true,
        }
    }
}

fn compile_pattern(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|source| Error::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Files and directories a watcher should register
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchSet {
    pub files: BTreeSet<PathBuf>,
    /// Directories holding at least one matched file, so newly created files
    /// inside them are observed too
    pub directories: BTreeSet<PathBuf>,
}

impl WatchSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Rooted {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    matcher: CompiledMatcher,
}

impl Rooted {
    fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok().or_else(|| {
            self.canonical_root
                .as_ref()
                .and_then(|root| path.strip_prefix(root).ok())
        })
    }
}

/// All matchers of one runner, each rooted at its own directory
#[derive(Debug, Clone)]
pub struct PathMatcher {
    matchers: Vec<Rooted>,
}

impl PathMatcher {
    /// Root every matcher at `base/matcher.path`, or `base` when the path is empty
    pub fn new(base: &Path, matchers: &[Matcher]) -> Result<Self> {
        let mut rooted = Vec::with_capacity(matchers.len());
        for matcher in matchers {
            let root = resolve_path(base, &matcher.path)?;
            let canonical_root = std::fs::canonicalize(&root).ok();
            rooted.push(Rooted {
                root,
                canonical_root,
                matcher: CompiledMatcher::compile(matcher)?,
            });
        }
        Ok(Self { matchers: rooted })
    }

    /// Walk every matcher root and collect the surviving regular files
    pub fn discover(&self) -> Result<WatchSet> {
        let mut set = WatchSet::default();

        for rooted in &self.matchers {
            if !rooted.root.is_dir() {
                warn!(root = %rooted.root.display(), "Matcher root does not exist, skipping");
                continue;
            }

            let walker = WalkDir::new(&rooted.root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| entry.file_name() != ".git");

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!(error = %err, "Skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }

                let path = entry.path();
                let Some(relative) = rooted.relative(path) else {
                    continue;
                };
                if rooted.matcher.is_match(&to_slash(relative)) {
                    if let Some(parent) = path.parent() {
                        set.directories.insert(parent.to_path_buf());
                    }
                    set.files.insert(path.to_path_buf());
                }
            }
        }

        debug!(
            files = set.files.len(),
            directories = set.directories.len(),
            "Discovered watch set"
        );
        Ok(set)
    }

    /// Whether an event path falls under some matcher root and passes its patterns
    pub fn matches(&self, path: &Path) -> bool {
        self.matchers.iter().any(|rooted| {
            rooted
                .relative(path)
                .map(|relative| rooted.matcher.is_match(&to_slash(relative)))
                .unwrap_or(false)
        })
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
