//! The repository contract and its transports.
//!
//! A repository is an object store addressed by `/`-separated keys under
//! three prefixes: `commits/`, `packs/`, and `tags/`. Implementations only
//! need the four operations in [`Repo`]; everything else in the engine is
//! built on top of them.

pub mod local;
#[cfg(feature = "backend-sftp")]
pub mod sftp;

use crossbeam_channel::Receiver;
use url::Url;

use crate::error::{ChunkyError, Result};

/// A file travelling to or from a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    pub path: String,
    pub data: Vec<u8>,
    pub mode: u32,
    pub mtime: i64,
}

impl RepoFile {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
            mode: 0o644,
            mtime: chrono::Utc::now().timestamp(),
        }
    }
}

/// Visitor verdict for [`Repo::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStep {
    Continue,
    /// Do not descend into the directory just visited.
    SkipSubtree,
    /// Stop the entire walk without error.
    SkipAll,
}

pub type WalkVisitor<'a> = dyn FnMut(&str, bool) -> Result<WalkStep> + 'a;

/// Abstract object store. Implementations are supplied per transport; the
/// engine holds them as trait objects.
pub trait Repo: Send + Sync {
    /// Consume files from the channel until every sender is dropped,
    /// creating parent directories as needed and overwriting existing
    /// objects. Multiple workers may drain one shared channel concurrently.
    fn upload(&self, files: Receiver<RepoFile>) -> Result<()>;

    /// Fetch one object. A missing object is `NotFound`, distinguished from
    /// transport failures.
    fn download(&self, path: &str) -> Result<RepoFile>;

    /// Depth-first enumeration under `prefix`, honoring the visitor's
    /// [`WalkStep`] verdicts. A missing prefix yields no entries and no
    /// error. Visitor errors stop the walk and propagate.
    fn walk(&self, prefix: &str, visit: &mut WalkVisitor) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Upload a single file through a short-lived channel.
pub fn upload_one(repo: &dyn Repo, file: RepoFile) -> Result<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    tx.send(file)
        .map_err(|_| ChunkyError::Other("upload channel rejected file".into()))?;
    drop(tx);
    repo.upload(rx)
}

/// Parsed repository location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoUrl {
    /// Local filesystem path.
    Local { path: String },
    /// SFTP remote: `sftp://[user@]host[:port]/path`.
    Sftp {
        user: Option<String>,
        host: String,
        port: Option<u16>,
        path: String,
    },
}

impl RepoUrl {
    /// Canonical string form, used to derive the local cache slug.
    pub fn canonical(&self) -> String {
        match self {
            RepoUrl::Local { path } => format!("file://{path}"),
            RepoUrl::Sftp {
                user,
                host,
                port,
                path,
            } => {
                let user = user.as_deref().map(|u| format!("{u}@")).unwrap_or_default();
                let port = port.map(|p| format!(":{p}")).unwrap_or_default();
                format!("sftp://{user}{host}{port}{path}")
            }
        }
    }
}

/// Parse a repository argument: a bare path, `file://`, or `sftp://`.
pub fn parse_repo_url(raw: &str) -> Result<RepoUrl> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ChunkyError::Validation(
            "repository path must not be empty".into(),
        ));
    }

    if !trimmed.contains("://") {
        return Ok(RepoUrl::Local {
            path: trimmed.to_string(),
        });
    }

    let url = Url::parse(trimmed)
        .map_err(|e| ChunkyError::Validation(format!("invalid repository URL '{trimmed}': {e}")))?;

    match url.scheme() {
        "file" => {
            let path = url.path().to_string();
            if path.is_empty() {
                return Err(ChunkyError::Validation("file:// URL has empty path".into()));
            }
            Ok(RepoUrl::Local { path })
        }
        "sftp" | "ssh" => {
            let host = url
                .host_str()
                .ok_or_else(|| ChunkyError::Validation("sftp:// URL is missing a host".into()))?
                .to_string();
            let user = (!url.username().is_empty()).then(|| url.username().to_string());
            Ok(RepoUrl::Sftp {
                user,
                host,
                port: url.port(),
                path: url.path().to_string(),
            })
        }
        other => Err(ChunkyError::Validation(format!(
            "unsupported repository scheme: '{other}'"
        ))),
    }
}

/// Open a repository from its URL string.
pub fn open(raw: &str) -> Result<Box<dyn Repo>> {
    match parse_repo_url(raw)? {
        RepoUrl::Local { path } => Ok(Box::new(local::LocalRepo::new(path))),
        #[cfg(feature = "backend-sftp")]
        RepoUrl::Sftp {
            user,
            host,
            port,
            path,
        } => Ok(Box::new(sftp::SftpRepo::connect(
            &host,
            user.as_deref(),
            port,
            &path,
        )?)),
        #[cfg(not(feature = "backend-sftp"))]
        RepoUrl::Sftp { .. } => Err(ChunkyError::Validation(
            "sftp support not compiled in (enable feature 'backend-sftp')".into(),
        )),
    }
}

/// Initialize the empty repository layout (`commits/`, `packs/`, `tags/`).
pub fn create(raw: &str) -> Result<()> {
    match parse_repo_url(raw)? {
        RepoUrl::Local { path } => local::LocalRepo::new(path).create(),
        #[cfg(feature = "backend-sftp")]
        RepoUrl::Sftp {
            user,
            host,
            port,
            path,
        } => sftp::SftpRepo::connect(&host, user.as_deref(), port, &path)?.create(),
        #[cfg(not(feature = "backend-sftp"))]
        RepoUrl::Sftp { .. } => Err(ChunkyError::Validation(
            "sftp support not compiled in (enable feature 'backend-sftp')".into(),
        )),
    }
}

/// Filesystem-safe slug of a repository URL, used as the local cache
/// directory name. Alphanumeric runs survive; everything else collapses to
/// single dashes.
pub fn slug(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut pending_dash = false;
    for c in url.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_paths_are_local() {
        assert_eq!(
            parse_repo_url("/backups/repo").unwrap(),
            RepoUrl::Local {
                path: "/backups/repo".into()
            }
        );
        assert_eq!(
            parse_repo_url("./relative").unwrap(),
            RepoUrl::Local {
                path: "./relative".into()
            }
        );
        assert_eq!(
            parse_repo_url("relative").unwrap(),
            RepoUrl::Local {
                path: "relative".into()
            }
        );
    }

    #[test]
    fn file_url_is_local() {
        assert_eq!(
            parse_repo_url("file:///backups/repo").unwrap(),
            RepoUrl::Local {
                path: "/backups/repo".into()
            }
        );
    }

    #[test]
    fn sftp_url_components() {
        assert_eq!(
            parse_repo_url("sftp://backup@nas.local:2222/srv/repo").unwrap(),
            RepoUrl::Sftp {
                user: Some("backup".into()),
                host: "nas.local".into(),
                port: Some(2222),
                path: "/srv/repo".into(),
            }
        );
        assert_eq!(
            parse_repo_url("sftp://nas.local/srv/repo").unwrap(),
            RepoUrl::Sftp {
                user: None,
                host: "nas.local".into(),
                port: None,
                path: "/srv/repo".into(),
            }
        );
    }

    #[test]
    fn unsupported_scheme_rejected() {
        let err = parse_repo_url("s3://bucket/path").unwrap_err();
        assert!(err.to_string().contains("unsupported repository scheme"));
    }

    #[test]
    fn empty_url_rejected() {
        assert!(parse_repo_url("  ").is_err());
    }

    #[test]
    fn slug_is_filesystem_safe() {
        assert_eq!(
            slug("sftp://backup@nas.local:2222/srv/repo"),
            "sftp-backup-nas-local-2222-srv-repo"
        );
        assert_eq!(slug("file:///backups/My Repo"), "file-backups-my-repo");
        assert_eq!(slug("///"), "");
    }

    #[test]
    fn canonical_roundtrips_through_parse() {
        let parsed = parse_repo_url("sftp://backup@nas.local/srv/repo").unwrap();
        assert_eq!(parse_repo_url(&parsed.canonical()).unwrap(), parsed);
    }
}
