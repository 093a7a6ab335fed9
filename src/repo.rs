//! Repository identifier parsed from the request path.
//!
//! Paths look like `/{owner}/{name}:{ref}[.git]{subpath}`, for example
//! `/octocat/Hello-World:v1.2/info/refs`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // The ref group is lazy so that an optional `.git` suffix is left for the
    // group after it instead of being swallowed into the ref name.
    Regex::new(
        r"^/([a-zA-Z0-9][-a-zA-Z0-9]+)/([a-zA-Z][-.a-zA-Z0-9]*):([a-zA-Z0-9][-.a-zA-Z0-9]*?)(?:\.git)?((?:/[a-zA-Z0-9][-.a-zA-Z0-9]*)*)$",
    )
    .expect("repository path pattern is valid")
});

/// Which upstream repository, ref and protocol subpath a request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
    /// Branch or tag name.
    pub git_ref: String,
    /// Zero or more `/segment` components, e.g. `/info/refs`.
    pub subpath: String,
}

impl RepoId {
    /// Match `path` against the repository grammar; `None` if it does not fit.
    pub fn parse(path: &str) -> Option<Self> {
        let caps = PATTERN.captures(path)?;
        Some(Self {
            owner: caps[1].to_owned(),
            name: caps[2].to_owned(),
            git_ref: caps[3].to_owned(),
            subpath: caps[4].to_owned(),
        })
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.owner, self.name, self.git_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(path: &str) -> RepoId {
        RepoId::parse(path).unwrap_or_else(|| panic!("{path} should parse"))
    }

    #[test]
    fn parses_info_refs_path() {
        let repo = parse("/octocat/Hello-World:test-branch/info/refs");
        assert_eq!(repo.owner, "octocat");
        assert_eq!(repo.name, "Hello-World");
        assert_eq!(repo.git_ref, "test-branch");
        assert_eq!(repo.subpath, "/info/refs");
    }

    #[test]
    fn parses_upload_pack_path() {
        let repo = parse("/x1/y:main/git-upload-pack");
        assert_eq!(repo.git_ref, "main");
        assert_eq!(repo.subpath, "/git-upload-pack");
    }

    #[test]
    fn strips_git_suffix_from_ref() {
        let repo = parse("/octocat/Hello-World:v1.2.git/info/refs");
        assert_eq!(repo.git_ref, "v1.2");
        assert_eq!(repo.subpath, "/info/refs");

        let repo = parse("/octocat/Hello-World:main.git");
        assert_eq!(repo.git_ref, "main");
        assert_eq!(repo.subpath, "");
    }

    #[test]
    fn keeps_dotted_ref_that_only_contains_git() {
        let repo = parse("/octocat/Hello-World:v1.git.x/info/refs");
        assert_eq!(repo.git_ref, "v1.git.x");
    }

    #[test]
    fn empty_subpath_is_allowed() {
        let repo = parse("/octocat/repo.name:v1.0.0");
        assert_eq!(repo.name, "repo.name");
        assert_eq!(repo.git_ref, "v1.0.0");
        assert_eq!(repo.subpath, "");
    }

    #[test]
    fn rejects_paths_outside_the_grammar() {
        for path in [
            "/",
            "/octocat/Hello-World",
            "/octocat/Hello-World/info/refs",
            "/o/repo:main/info/refs",
            "/octocat/1repo:main/info/refs",
            "/octocat/repo:/info/refs",
            "/octocat/repo:-main/info/refs",
            "/octocat/repo:main/info//refs",
            "/octocat/repo:main/info/refs/",
            "/octo_cat/repo:main",
            "octocat/repo:main",
        ] {
            assert!(RepoId::parse(path).is_none(), "{path} should not parse");
        }
    }

    #[test]
    fn display_names_repository_and_ref() {
        let repo = parse("/octocat/Hello-World:main/info/refs");
        assert_eq!(repo.to_string(), "octocat/Hello-World:main");
    }
}
