use tracing::debug;

use crate::commit;
use crate::error::{ChunkyError, Result};
use crate::repos::{upload_one, Repo};
use crate::tags::{self, Tag, LATEST};

/// Append a resolved revision to a tag's history, creating the tag if it
/// does not exist. The tag file is rewritten whole; its logical semantics
/// are append-only.
pub fn tag_revision(repo: &dyn Repo, name: &str, revision: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ChunkyError::Validation("tag cannot be empty".into()));
    }
    if name == LATEST {
        return Err(ChunkyError::Validation(format!("tag cannot be '{LATEST}'")));
    }

    // The revision must name an existing, decodable commit before it enters
    // any tag history.
    let commit = commit::read(repo, revision)?;

    let mut tag = match tags::read(repo, name) {
        Ok(tag) => tag,
        Err(e) if e.is_not_found() => Tag::new(name),
        Err(e) => return Err(e),
    };
    tag.commits.push(commit.id());
    debug!(tag = name, commit = %commit.id(), "tagging revision");
    upload_one(repo, tag.file())
}
