//! Hierarchical configuration loading
//!
//! Resolves the `extends`/`includes` graph of a project configuration into a
//! single merged [`ProjectConfig`]. Cycle detection uses a visited set scoped
//! to the current dependency chain, so diamond dependencies are legal while
//! any cycle fails with `CircularInclude`.
//!
//! For each file the fold order is `merge(merge(E, S), I)`: extends form a
//! base under the file itself, includes overlay on top. Within the `extends`
//! list the first entry wins (each later entry becomes a base *under* the
//! accumulator); within `includes` the last entry wins (plain overlay fold).
//!
//! All file access goes through the injected [`FileSystem`], including glob
//! expansion, so the loader is fully testable against an in-memory tree.

use crate::config::{self, ConfigFragment, ParsedFile, ProjectConfig};
use crate::env::FileSystem;
use crate::errors::{ConfigError, Result};
use globset::Glob;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, instrument};

/// Default configuration file name inside a project directory
pub const CONFIG_FILE_NAME: &str = "alcatraz.toml";

/// The configuration path for a project directory
pub fn discover_config(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_FILE_NAME)
}

/// Load, merge and normalize the configuration rooted at `path`
#[instrument(skip(fs), fields(path = %path.display()))]
pub fn load_project_config(fs: &dyn FileSystem, path: &Path) -> Result<ProjectConfig> {
    let entry = lexical_normalize(path);
    let mut loader = Loader {
        fs,
        chain: Vec::new(),
    };
    let fragment = loader.load_fragment(&entry)?;
    let project_name = entry
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sandbox".to_string());
    config::normalize(fragment, &project_name)
}

struct Loader<'a> {
    fs: &'a dyn FileSystem,
    /// Absolute paths on the current dependency chain. Scoped per chain, not
    /// globally, so a diamond is not misreported as a cycle.
    chain: Vec<PathBuf>,
}

impl Loader<'_> {
    fn load_fragment(&mut self, path: &Path) -> Result<ConfigFragment> {
        if self.chain.iter().any(|p| p == path) {
            return Err(ConfigError::CircularInclude {
                path: path.display().to_string(),
            }
            .into());
        }
        if !self.fs.exists(path) {
            return Err(ConfigError::MissingInclude {
                path: path.display().to_string(),
            }
            .into());
        }

        let text = self.fs.read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let ParsedFile {
            fragment,
            includes,
            extends,
        } = config::parse_file(&text, path)?;

        debug!(
            includes = includes.len(),
            extends = extends.len(),
            "Loaded configuration file {}",
            path.display()
        );

        self.chain.push(path.to_path_buf());
        let result = self.fold(path, fragment, &includes, &extends);
        self.chain.pop();
        result
    }

    fn fold(
        &mut self,
        path: &Path,
        own: ConfigFragment,
        includes: &[String],
        extends: &[String],
    ) -> Result<ConfigFragment> {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        // Each new extends entry becomes a base under the accumulator, which
        // keeps earlier entries stronger.
        let mut base = ConfigFragment::default();
        for target in self.expand_entries(&dir, extends)? {
            let loaded = self.load_fragment(&target)?;
            base = config::merge(loaded, base);
        }

        // Self overlays the extends base; includes overlay self, last wins.
        let mut merged = config::merge(base, own);
        for target in self.expand_entries(&dir, includes)? {
            let loaded = self.load_fragment(&target)?;
            merged = config::merge(merged, loaded);
        }
        Ok(merged)
    }

    /// Expand a list of include/extends entries into concrete paths.
    ///
    /// A literal path that does not exist fails; a glob that matches nothing
    /// silently contributes nothing. Glob matches are sorted for determinism.
    fn expand_entries(&self, dir: &Path, entries: &[String]) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in entries {
            if is_glob(entry) {
                paths.extend(self.expand_glob(dir, entry)?);
            } else {
                let path = lexical_normalize(&dir.join(entry));
                if !self.fs.exists(&path) {
                    return Err(ConfigError::MissingInclude {
                        path: path.display().to_string(),
                    }
                    .into());
                }
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn expand_glob(&self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        let full = lexical_normalize(&dir.join(pattern));
        let matcher = Glob::new(&full.to_string_lossy())
            .map_err(|e| ConfigError::Validation {
                message: format!("Invalid include pattern '{}': {}", pattern, e),
            })?
            .compile_matcher();

        let mut matches = Vec::new();
        self.walk(&static_prefix(&full), &mut |candidate| {
            if matcher.is_match(&candidate) {
                matches.push(candidate);
            }
        });
        matches.sort();
        Ok(matches)
    }

    fn walk(&self, dir: &Path, visit: &mut dyn FnMut(PathBuf)) {
        let Ok(entries) = self.fs.read_dir(dir) else {
            return;
        };
        for entry in entries {
            if self.fs.is_dir(&entry) {
                self.walk(&entry, visit);
            } else {
                visit(entry);
            }
        }
    }
}

fn is_glob(entry: &str) -> bool {
    entry.contains(['*', '?', '[', ']', '{', '}'])
}

/// The longest leading path with no glob metacharacters; the walk root
fn static_prefix(pattern: &Path) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in pattern.components() {
        if is_glob(&component.as_os_str().to_string_lossy()) {
            break;
        }
        prefix.push(component);
    }
    prefix
}

/// Resolve `.` and `..` components without touching the filesystem, so the
/// loader behaves identically on the host and on an in-memory tree
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::mock::MemFs;
    use crate::errors::AlcatrazError;

    fn load(fs: &MemFs, path: &str) -> Result<ProjectConfig> {
        load_project_config(fs, Path::new(path))
    }

    #[test]
    fn test_nested_include_beats_self_at_each_level() {
        let fs = MemFs::new()
            .with_file("/p/alcatraz.toml", "includes = [\"dev.toml\"]\n")
            .with_file("/p/dev.toml", "image = \"d\"\nincludes = [\"common.toml\"]\n")
            .with_file("/p/common.toml", "image = \"c\"\n");
        let config = load(&fs, "/p/alcatraz.toml").unwrap();
        assert_eq!(config.image, "c");
    }

    #[test]
    fn test_extends_first_entry_wins() {
        let fs = MemFs::new()
            .with_file("/p/alcatraz.toml", "extends = [\"b.toml\", \"c.toml\"]\n")
            .with_file("/p/b.toml", "image = \"b\"\n")
            .with_file("/p/c.toml", "image = \"c\"\n");
        let config = load(&fs, "/p/alcatraz.toml").unwrap();
        assert_eq!(config.image, "b");
    }

    #[test]
    fn test_includes_last_entry_wins() {
        let fs = MemFs::new()
            .with_file("/p/alcatraz.toml", "image = \"a\"\nincludes = [\"b.toml\", \"c.toml\"]\n")
            .with_file("/p/b.toml", "image = \"b\"\n")
            .with_file("/p/c.toml", "image = \"c\"\n");
        let config = load(&fs, "/p/alcatraz.toml").unwrap();
        assert_eq!(config.image, "c");
    }

    #[test]
    fn test_includes_beat_self_beat_extends() {
        let fs = MemFs::new()
            .with_file(
                "/p/alcatraz.toml",
                "image = \"self\"\nextends = [\"base.toml\"]\nincludes = [\"over.toml\"]\n",
            )
            .with_file("/p/base.toml", "image = \"base\"\nworkdir = \"/from-base\"\n")
            .with_file("/p/over.toml", "image = \"over\"\n");
        let config = load(&fs, "/p/alcatraz.toml").unwrap();
        assert_eq!(config.image, "over");
        // extends still contributes fields nothing above sets
        assert_eq!(config.workdir, "/from-base");
    }

    #[test]
    fn test_cycle_fails_with_circular_include() {
        let fs = MemFs::new()
            .with_file("/p/alcatraz.toml", "image = \"u\"\nincludes = [\"b.toml\"]\n")
            .with_file("/p/b.toml", "includes = [\"alcatraz.toml\"]\n");
        let err = load(&fs, "/p/alcatraz.toml").unwrap_err();
        match err {
            AlcatrazError::Config(ConfigError::CircularInclude { path }) => {
                assert!(path.contains("alcatraz.toml"));
            }
            other => panic!("expected CircularInclude, got {:?}", other),
        }
    }

    #[test]
    fn test_self_extend_is_a_cycle() {
        let fs = MemFs::new().with_file("/p/alcatraz.toml", "extends = [\"alcatraz.toml\"]\n");
        assert!(matches!(
            load(&fs, "/p/alcatraz.toml").unwrap_err(),
            AlcatrazError::Config(ConfigError::CircularInclude { .. })
        ));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let fs = MemFs::new()
            .with_file(
                "/p/alcatraz.toml",
                "includes = [\"left.toml\", \"right.toml\"]\n",
            )
            .with_file("/p/left.toml", "includes = [\"common.toml\"]\n")
            .with_file("/p/right.toml", "includes = [\"common.toml\"]\n")
            .with_file("/p/common.toml", "image = \"c\"\n");
        let config = load(&fs, "/p/alcatraz.toml").unwrap();
        assert_eq!(config.image, "c");
    }

    #[test]
    fn test_missing_literal_include_fails() {
        let fs = MemFs::new()
            .with_file("/p/alcatraz.toml", "image = \"u\"\nincludes = [\"absent.toml\"]\n");
        assert!(matches!(
            load(&fs, "/p/alcatraz.toml").unwrap_err(),
            AlcatrazError::Config(ConfigError::MissingInclude { .. })
        ));
    }

    #[test]
    fn test_empty_glob_contributes_nothing() {
        let fs = MemFs::new()
            .with_file("/p/alcatraz.toml", "image = \"u\"\nincludes = [\"conf.d/*.toml\"]\n");
        let config = load(&fs, "/p/alcatraz.toml").unwrap();
        assert_eq!(config.image, "u");
    }

    #[test]
    fn test_glob_matches_sorted_lexicographically() {
        let fs = MemFs::new()
            .with_file("/p/alcatraz.toml", "includes = [\"conf.d/*.toml\"]\n")
            .with_file("/p/conf.d/10-first.toml", "image = \"first\"\n")
            .with_file("/p/conf.d/20-second.toml", "image = \"second\"\n");
        // Later (lexicographically greater) include wins
        let config = load(&fs, "/p/alcatraz.toml").unwrap();
        assert_eq!(config.image, "second");
    }

    #[test]
    fn test_relative_parent_include() {
        let fs = MemFs::new()
            .with_file("/p/sub/alcatraz.toml", "includes = [\"../shared.toml\"]\n")
            .with_file("/p/shared.toml", "image = \"shared\"\n");
        let config = load(&fs, "/p/sub/alcatraz.toml").unwrap();
        assert_eq!(config.image, "shared");
        // Project name comes from the config's own directory
        assert_eq!(config.workdir, "/workspaces/sub");
    }

    #[test]
    fn test_lexical_normalize() {
        assert_eq!(
            lexical_normalize(Path::new("/a/b/../c/./d.toml")),
            PathBuf::from("/a/c/d.toml")
        );
        assert_eq!(
            lexical_normalize(Path::new("/a/../../b")),
            PathBuf::from("/b")
        );
    }

    #[test]
    fn test_included_commands_append() {
        let fs = MemFs::new()
            .with_file(
                "/p/alcatraz.toml",
                "image = \"u\"\nincludes = [\"extra.toml\"]\n[commands]\nup = \"apt-get update\"\n",
            )
            .with_file(
                "/p/extra.toml",
                "[commands]\nup = { command = \"&& make\", append = true }\n",
            );
        let config = load(&fs, "/p/alcatraz.toml").unwrap();
        assert_eq!(
            config.commands.up.as_ref().unwrap().command,
            "apt-get update && make"
        );
    }
}
