//! Module path extraction and repository binding.
//!
//! A GOPROXY request path looks like `/<module>/@v/<version>.info` or
//! `/<module>/@latest`. The module is everything before the first `/@`
//! marker. Only modules hosted on [`SUPPORTED_HOST`] can be bound to a
//! token's `repository` claim; the first three segments of such a module
//! (`github.com/<owner>/<repo>`) name the repository, and anything below is
//! a package inside it.

use std::fmt;

use crate::error::AuthError;

/// The only code host whose modules map onto GitHub Actions repositories.
pub const SUPPORTED_HOST: &str = "github.com";

/// Separator between a module path and its version query.
const VERSION_MARKER: &str = "/@";

/// Normalized module path, e.g. `github.com/owner/repo/sub/pkg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModulePath(String);

impl ModulePath {
    /// Borrow the normalized path.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `owner/repo` pair. Comparison ignores ASCII case.
#[derive(Debug, Clone)]
pub struct RepositoryId {
    owner: String,
    name: String,
}

impl RepositoryId {
    /// Repository owner (user or organization).
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Repository name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `claimed` (an `owner/repo` string) names this repository.
    #[must_use]
    pub fn matches(&self, claimed: &str) -> bool {
        let Some((owner, name)) = claimed.split_once('/') else {
            return false;
        };
        self.owner.eq_ignore_ascii_case(owner) && self.name.eq_ignore_ascii_case(name)
    }
}

impl PartialEq for RepositoryId {
    fn eq(&self, other: &Self) -> bool {
        self.owner.eq_ignore_ascii_case(&other.owner) && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for RepositoryId {}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Extract the module path from a GOPROXY request path.
///
/// Cuts at the first `/@`, strips one leading `/`, then cleans the result
/// lexically. A path without the marker is taken whole.
pub fn extract_module_path(request_path: &str) -> Result<ModulePath, AuthError> {
    let module = request_path
        .split_once(VERSION_MARKER)
        .map_or(request_path, |(module, _)| module);
    let module = module.strip_prefix('/').unwrap_or(module);
    if module.is_empty() {
        return Err(AuthError::InvalidPath(request_path.to_string()));
    }

    let cleaned = clean(module);
    if cleaned == "." || cleaned == "/" {
        return Err(AuthError::InvalidPath(request_path.to_string()));
    }

    Ok(ModulePath(cleaned))
}

/// Derive the `owner/repo` a module belongs to.
pub fn extract_repository(module_path: &ModulePath) -> Result<RepositoryId, AuthError> {
    let parts: Vec<&str> = module_path.as_str().splitn(4, '/').collect();
    if parts.len() < 3 || parts[1].is_empty() || parts[2].is_empty() {
        return Err(AuthError::InvalidModulePath(module_path.to_string()));
    }

    if parts[0] != SUPPORTED_HOST {
        return Err(AuthError::UnsupportedHost(parts[0].to_string()));
    }

    Ok(RepositoryId {
        owner: parts[1].to_string(),
        name: parts[2].to_string(),
    })
}

/// Whether `module_path` lives in `claimed_repository` (`owner/repo`).
pub fn matches_repository(
    module_path: &ModulePath,
    claimed_repository: &str,
) -> Result<bool, AuthError> {
    let repository = extract_repository(module_path)?;
    Ok(repository.matches(claimed_repository))
}

/// Lexical path cleaning with the same results as Go's `path.Clean`.
///
/// Collapses repeated separators, drops `.` elements, resolves `..`
/// against the preceding element. `..` that cannot be resolved is kept
/// on relative paths and dropped on rooted ones.
fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match stack.last() {
                Some(&last) if last != ".." => {
                    stack.pop();
                }
                _ if !rooted => stack.push(".."),
                _ => {}
            },
            other => stack.push(other),
        }
    }

    let joined = stack.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
