//! Tags: named, ordered lists of commit ids under `tags/`. The last line of
//! a tag file is its newest commit. `latest` is reserved and rewritten by
//! every upload; user tags grow by appending a commit and rewriting the file.

use std::collections::HashMap;

use crate::error::Result;
use crate::repos::{Repo, RepoFile, WalkStep};

/// The reserved tag written by every upload.
pub const LATEST: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub commits: Vec<String>,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commits: Vec::new(),
        }
    }

    /// The newest commit in this tag's history.
    pub fn newest(&self) -> Option<&str> {
        self.commits.last().map(String::as_str)
    }

    /// Render the tag file: newline-joined ids with a trailing newline.
    pub fn render(&self) -> Vec<u8> {
        let mut out = self.commits.join("\n").into_bytes();
        out.push(b'\n');
        out
    }

    /// The repository file carrying this tag.
    pub fn file(&self) -> RepoFile {
        RepoFile::new(format!("tags/{}", self.name), self.render())
    }
}

/// Read one tag. Trailing blank lines are trimmed; a missing tag propagates
/// as `NotFound` for the caller to interpret (the `tag` command treats it as
/// empty history).
pub fn read(repo: &dyn Repo, name: &str) -> Result<Tag> {
    let file = repo.download(&format!("tags/{name}"))?;
    let text = String::from_utf8_lossy(&file.data);
    let commits = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    Ok(Tag {
        name: name.to_string(),
        commits,
    })
}

/// All tags, sorted by name.
pub fn read_all(repo: &dyn Repo) -> Result<Vec<Tag>> {
    let mut tags = Vec::new();
    repo.walk("tags", &mut |path, is_dir| {
        if is_dir {
            return Ok(WalkStep::Continue);
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        tags.push(read(repo, name)?);
        Ok(WalkStep::Continue)
    })?;
    tags.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tags)
}

/// Index tags by their newest commit, for annotating commit listings.
pub fn read_map(repo: &dyn Repo) -> Result<HashMap<String, Vec<Tag>>> {
    let mut map: HashMap<String, Vec<Tag>> = HashMap::new();
    for tag in read_all(repo)? {
        if let Some(newest) = tag.newest() {
            map.entry(newest.to_string()).or_default().push(tag);
        }
    }
    Ok(map)
}
