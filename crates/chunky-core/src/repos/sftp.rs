use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crossbeam_channel::Receiver;
use ssh2::{ErrorCode, OpenFlags, OpenType, Session, Sftp};
use tracing::debug;

use crate::error::{ChunkyError, Result};
use crate::repos::{Repo, RepoFile, WalkStep, WalkVisitor};

/// SFTP status code for a missing remote file.
const SFTP_NO_SUCH_FILE: i32 = 2;

const DEFAULT_PORT: u16 = 22;

/// Repository reached over SFTP. The libssh2 session is not thread-safe, so
/// a mutex serializes all remote operations; concurrency above this layer
/// still overlaps chunking and hashing with transfers.
pub struct SftpRepo {
    conn: Mutex<Conn>,
    root: PathBuf,
}

struct Conn {
    session: Session,
    sftp: Sftp,
}

impl SftpRepo {
    /// Connect and authenticate. Tries the SSH agent first, then the
    /// conventional key files under `~/.ssh`.
    pub fn connect(host: &str, user: Option<&str>, port: Option<u16>, path: &str) -> Result<Self> {
        let user = user.map(str::to_string).unwrap_or_else(whoami::username);

        let addr = (host, port.unwrap_or(DEFAULT_PORT));
        let tcp = TcpStream::connect(addr)?;
        let mut session = Session::new().map_err(ssh_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(ssh_err)?;

        authenticate(&session, &user)?;

        let sftp = session.sftp().map_err(ssh_err)?;
        debug!(host, user = %user, "sftp session established");

        Ok(Self {
            conn: Mutex::new(Conn { session, sftp }),
            root: PathBuf::from(path.trim_end_matches('/')),
        })
    }

    /// Create the repository layout on the remote side.
    pub fn create(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        for dir in ["commits", "packs", "tags"] {
            mkdir_p(&conn.sftp, &self.root.join(dir))?;
        }
        Ok(())
    }

    fn remote_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn walk_dir(
        &self,
        conn: &Conn,
        dir: &Path,
        visit: &mut WalkVisitor,
    ) -> Result<WalkStep> {
        let mut entries = match conn.sftp.readdir(dir) {
            Ok(entries) => entries,
            Err(e) if is_missing(&e) => return Ok(WalkStep::Continue),
            Err(e) => return Err(ssh_err(e)),
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, stat) in entries {
            let rel = path
                .strip_prefix(&self.root)
                .map_err(|_| ChunkyError::Other("sftp walk escaped repository root".into()))?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let is_dir = stat.is_dir();

            match visit(&key, is_dir)? {
                WalkStep::SkipAll => return Ok(WalkStep::SkipAll),
                WalkStep::SkipSubtree => continue,
                WalkStep::Continue => {
                    if is_dir && self.walk_dir(conn, &path, visit)? == WalkStep::SkipAll {
                        return Ok(WalkStep::SkipAll);
                    }
                }
            }
        }
        Ok(WalkStep::Continue)
    }
}

impl Repo for SftpRepo {
    fn upload(&self, files: Receiver<RepoFile>) -> Result<()> {
        for file in files.iter() {
            let conn = self.conn.lock().unwrap();
            let remote = self.remote_path(&file.path);
            if let Some(parent) = remote.parent() {
                mkdir_p(&conn.sftp, parent)?;
            }

            let mut handle = conn
                .sftp
                .open_mode(
                    &remote,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    (file.mode & 0o7777) as i32,
                    OpenType::File,
                )
                .map_err(ssh_err)?;
            handle.write_all(&file.data)?;
        }
        Ok(())
    }

    fn download(&self, path: &str) -> Result<RepoFile> {
        let conn = self.conn.lock().unwrap();
        let remote = self.remote_path(path);

        let mut handle = match conn.sftp.open(&remote) {
            Ok(h) => h,
            Err(e) if is_missing(&e) => return Err(ChunkyError::NotFound(path.to_string())),
            Err(e) => return Err(ssh_err(e)),
        };

        let stat = handle.stat().map_err(ssh_err)?;
        let mut data = Vec::with_capacity(stat.size.unwrap_or(0) as usize);
        handle.read_to_end(&mut data)?;

        Ok(RepoFile {
            path: path.to_string(),
            data,
            mode: stat.perm.unwrap_or(0o644),
            mtime: stat.mtime.unwrap_or(0) as i64,
        })
    }

    fn walk(&self, prefix: &str, visit: &mut WalkVisitor) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        self.walk_dir(&conn, &self.remote_path(prefix), visit)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.session
            .disconnect(None, "closing repository", None)
            .map_err(ssh_err)
    }
}

fn authenticate(session: &Session, user: &str) -> Result<()> {
    if session.userauth_agent(user).is_ok() && session.authenticated() {
        return Ok(());
    }

    let home = std::env::var("HOME").map(PathBuf::from).map_err(|_| {
        ChunkyError::Validation("sftp: agent auth failed and HOME is unset".into())
    })?;
    for key in ["id_ed25519", "id_rsa"] {
        let key_path = home.join(".ssh").join(key);
        if key_path.exists()
            && session
                .userauth_pubkey_file(user, None, &key_path, None)
                .is_ok()
            && session.authenticated()
        {
            return Ok(());
        }
    }

    Err(ChunkyError::Validation(format!(
        "sftp: authentication failed for user '{user}'"
    )))
}

fn mkdir_p(sftp: &Sftp, dir: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if current.as_os_str().is_empty() || current == Path::new("/") {
            continue;
        }
        match sftp.stat(&current) {
            Ok(stat) if stat.is_dir() => continue,
            Ok(_) => {
                return Err(ChunkyError::Other(format!(
                    "sftp: '{}' exists and is not a directory",
                    current.display()
                )))
            }
            Err(_) => {
                if let Err(e) = sftp.mkdir(&current, 0o755) {
                    // A concurrent worker may have created it between the
                    // stat and the mkdir.
                    match sftp.stat(&current) {
                        Ok(stat) if stat.is_dir() => continue,
                        _ => return Err(ssh_err(e)),
                    }
                }
            }
        }
    }
    Ok(())
}

fn is_missing(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

fn ssh_err(e: ssh2::Error) -> ChunkyError {
    ChunkyError::Other(format!("sftp: {e}"))
}
