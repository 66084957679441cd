use std::io::Write;
use std::path::Path;

use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Table};
use tracing_subscriber::EnvFilter;

use chunky_core::cache::LocalCache;
use chunky_core::cancel::CancelToken;
use chunky_core::ops::download::{cat, download, DownloadOptions};
use chunky_core::ops::upload::{upload, UploadOptions};
use chunky_core::ops::{cache_ops, tag};
use chunky_core::repos;
use chunky_core::{commit, tags};

#[derive(Parser)]
#[command(
    name = "chunky",
    version,
    about = "Efficiently store versioned snapshots of directory trees",
    after_help = "\
Repository locations:
  /path/to/repo                   local directory
  file:///path/to/repo            local directory
  sftp://user@host[:port]/path    remote over SFTP (build with 'backend-sftp')

The per-repository metadata cache lives under the platform cache directory
(e.g. ~/.cache/chunky)."
)]
struct Cli {
    /// Log level: debug, info, warn, or error
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new empty repository
    Create {
        /// Repository location
        repo: String,
    },

    /// Upload a directory tree as a new snapshot
    Upload {
        /// Source directory
        from: String,

        /// Destination repository
        repo: String,

        /// Tag the new commit (repeatable; 'latest' is reserved)
        #[arg(short = 't', long = "tag")]
        tags: Vec<String>,

        /// Commit author (defaults to the current user)
        #[arg(long)]
        user: Option<String>,

        /// Upload rate limit, bytes/sec (e.g. 10MiB)
        #[arg(long)]
        limit_upload: Option<String>,

        /// Number of concurrent uploader workers (default: 2x CPUs)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Maximum pack size (default: 32MiB)
        #[arg(long)]
        max_pack_size: Option<String>,

        /// Minimum chunk size (default: 512KiB)
        #[arg(long)]
        min_chunk_size: Option<String>,

        /// Maximum chunk size (default: 8MiB)
        #[arg(long)]
        max_chunk_size: Option<String>,
    },

    /// Download a snapshot into a directory
    Download {
        /// Source repository
        repo: String,

        /// Destination directory
        to: String,

        /// Commit id or tag to download
        #[arg(long, default_value = "latest")]
        revision: String,

        /// Download rate limit, bytes/sec (e.g. 10MiB)
        #[arg(long)]
        limit_download: Option<String>,

        /// Files restored in parallel per batch (default: all)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Byte budget of the pack cache (default: 512MiB)
        #[arg(long)]
        max_cache_size: Option<String>,
    },

    /// Stream one file from a snapshot to stdout
    Cat {
        /// Repository
        repo: String,

        /// File path inside the snapshot
        path: String,

        /// Commit id or tag
        #[arg(long, default_value = "latest")]
        revision: String,
    },

    /// List commits, newest first
    List {
        /// Repository
        repo: String,
    },

    /// Show one commit's metadata and files
    Show {
        /// Repository
        repo: String,

        /// Commit id or tag
        revision: String,
    },

    /// Add a commit to a tag's history
    Tag {
        /// Repository
        repo: String,

        /// Tag name
        tag: String,

        /// Commit id or tag to resolve
        #[arg(long, default_value = "latest")]
        revision: String,
    },

    /// List tags with their commit history
    Tags {
        /// Repository
        repo: String,
    },

    /// Delete the local metadata cache of one repository
    CachePrune {
        /// Repository
        repo: String,
    },

    /// Report total local cache usage
    CacheSize,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Create { repo } => {
            repos::create(&repo)?;
            println!("Created repository at {repo}");
            Ok(())
        }

        Commands::Upload {
            from,
            repo,
            tags,
            user,
            limit_upload,
            concurrency,
            max_pack_size,
            min_chunk_size,
            max_chunk_size,
        } => {
            let backend = repos::open(&repo)?;
            let mut cache = open_cache(&repo)?;

            let defaults = UploadOptions::default();
            let opts = UploadOptions {
                user,
                tags,
                ignore: None,
                max_pack_size: parse_opt_size(&max_pack_size, defaults.max_pack_size)?,
                min_chunk_size: parse_opt_size(&min_chunk_size, defaults.min_chunk_size)?,
                max_chunk_size: parse_opt_size(&max_chunk_size, defaults.max_chunk_size)?,
                limit_upload: parse_opt_size(&limit_upload, 0)? as u64,
                concurrency: concurrency.unwrap_or(0),
            };

            let commit_id = upload(
                Path::new(&from),
                backend.as_ref(),
                &mut cache,
                &opts,
                &CancelToken::new(),
            )?;
            backend.close()?;
            println!("{commit_id}");
            Ok(())
        }

        Commands::Download {
            repo,
            to,
            revision,
            limit_download,
            concurrency,
            max_cache_size,
        } => {
            let backend = repos::open(&repo)?;
            let defaults = DownloadOptions::default();
            let opts = DownloadOptions {
                max_cache_size: parse_opt_size(
                    &max_cache_size,
                    defaults.max_cache_size as usize,
                )? as u64,
                limit_download: parse_opt_size(&limit_download, 0)? as u64,
                concurrency: concurrency.unwrap_or(0),
            };
            download(
                backend.as_ref(),
                Path::new(&to),
                &revision,
                &opts,
                &CancelToken::new(),
            )?;
            backend.close()?;
            Ok(())
        }

        Commands::Cat {
            repo,
            path,
            revision,
        } => {
            let backend = repos::open(&repo)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            cat(
                backend.as_ref(),
                &revision,
                &path,
                &mut out,
                &DownloadOptions::default(),
                &CancelToken::new(),
            )?;
            out.flush()?;
            backend.close()?;
            Ok(())
        }

        Commands::List { repo } => {
            let backend = repos::open(&repo)?;
            let commits = commit::read_all(backend.as_ref())?;
            let tag_map = tags::read_map(backend.as_ref())?;
            backend.close()?;

            if commits.is_empty() {
                println!("No commits found.");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL_CONDENSED);
            table.set_header(vec!["Commit", "Tags", "Size", "User", "Created"]);
            for c in &commits {
                let tag_names = tag_map
                    .get(&c.id())
                    .map(|tags| {
                        tags.iter()
                            .map(|t| t.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                table.add_row(vec![
                    c.id(),
                    tag_names,
                    format_bytes(c.size()),
                    c.user().to_string(),
                    c.created_at().format("%Y-%m-%d %H:%M:%S").to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        Commands::Show { repo, revision } => {
            let backend = repos::open(&repo)?;
            let c = commit::read(backend.as_ref(), &revision)?;
            backend.close()?;

            println!("commit  {}", c.id());
            println!("user    {}", c.user());
            println!("date    {}", c.created_at().format("%Y-%m-%d %H:%M:%S UTC"));
            println!("size    {}", format_bytes(c.size()));
            println!();
            for f in c.files() {
                println!("{:>10}  {}", format_bytes(f.size), f.path);
            }
            Ok(())
        }

        Commands::Tag {
            repo,
            tag: name,
            revision,
        } => {
            let backend = repos::open(&repo)?;
            tag::tag_revision(backend.as_ref(), &name, &revision)?;
            backend.close()?;
            println!("Tagged {revision} as {name}");
            Ok(())
        }

        Commands::Tags { repo } => {
            let backend = repos::open(&repo)?;
            let all = tags::read_all(backend.as_ref())?;
            backend.close()?;

            if all.is_empty() {
                println!("No tags found.");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL_CONDENSED);
            table.set_header(vec!["Tag", "Newest", "History"]);
            for t in &all {
                table.add_row(vec![
                    t.name.clone(),
                    t.newest().unwrap_or("-").to_string(),
                    t.commits.len().to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        Commands::CachePrune { repo } => {
            let url = repos::parse_repo_url(&repo)?;
            cache_ops::prune(&url.canonical())?;
            println!("Pruned cache for {repo}");
            Ok(())
        }

        Commands::CacheSize => {
            let total = cache_ops::total_size()?;
            println!("{}", format_bytes(total));
            Ok(())
        }
    }
}

fn open_cache(repo: &str) -> Result<LocalCache, Box<dyn std::error::Error>> {
    let url = repos::parse_repo_url(repo)?;
    Ok(LocalCache::open_for(&url.canonical())?)
}

fn parse_opt_size(
    value: &Option<String>,
    default: usize,
) -> Result<usize, Box<dyn std::error::Error>> {
    match value {
        Some(s) => Ok(parse_size(s)?),
        None => Ok(default),
    }
}

/// Parse a human-readable size like "512KiB", "32M", or "1048576" into bytes.
fn parse_size(s: &str) -> Result<usize, String> {
    let cleaned = s.trim();
    if cleaned.is_empty() {
        return Err("empty size string".into());
    }

    // Strip an optional "B"/"iB" unit suffix, then the scale letter.
    let mut num = cleaned;
    for suffix in ["iB", "IB", "ib", "B", "b"] {
        if let Some(stripped) = num.strip_suffix(suffix) {
            num = stripped;
            break;
        }
    }

    let (digits, multiplier) = match num.as_bytes().last() {
        Some(b'K' | b'k') => (&num[..num.len() - 1], 1024usize),
        Some(b'M' | b'm') => (&num[..num.len() - 1], 1024 * 1024),
        Some(b'G' | b'g') => (&num[..num.len() - 1], 1024 * 1024 * 1024),
        _ => (num, 1),
    };

    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size: '{s}'"))?;
    if value < 0.0 {
        return Err(format!("invalid size: '{s}'"));
    }
    Ok((value * multiplier as f64) as usize)
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_handles_units() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("512KiB").unwrap(), 512 * 1024);
        assert_eq!(parse_size("32M").unwrap(), 32 * 1024 * 1024);
        assert_eq!(parse_size("32MiB").unwrap(), 32 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("10b").unwrap(), 10);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("-5M").is_err());
    }

    #[test]
    fn format_bytes_picks_a_unit() {
        assert_eq!(format_bytes(100), "100 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(32 * 1024 * 1024), "32.00 MiB");
    }

    #[test]
    fn cli_parses_upload_with_tags() {
        let cli = Cli::try_parse_from([
            "chunky", "upload", "./src", "/repo", "-t", "v1", "-t", "v2", "--concurrency", "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Upload {
                from,
                repo,
                tags,
                concurrency,
                ..
            } => {
                assert_eq!(from, "./src");
                assert_eq!(repo, "/repo");
                assert_eq!(tags, vec!["v1", "v2"]);
                assert_eq!(concurrency, Some(4));
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn cli_download_defaults_to_latest() {
        let cli = Cli::try_parse_from(["chunky", "download", "/repo", "./out"]).unwrap();
        match cli.command {
            Commands::Download { revision, .. } => assert_eq!(revision, "latest"),
            _ => panic!("wrong subcommand"),
        }
    }
}
