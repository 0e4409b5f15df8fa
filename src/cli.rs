//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use readstash::DEFAULT_API_BASE;

/// Export a saved-article library to durable local storage.
///
/// Readstash walks the upstream listing with a persisted cursor, then
/// downloads each article's original page content and images, resuming
/// safely across restarts and respecting the upstream request quota.
#[derive(Parser, Debug)]
#[command(name = "readstash")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Directory holding persisted session state
    #[arg(long, default_value = "./readstash-data")]
    pub data_dir: PathBuf,

    /// Long-lived upstream access token (falls back to READSTASH_TOKEN)
    #[arg(long)]
    pub token: Option<String>,

    /// Base URL of the upstream service
    #[arg(long, default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Operations against the session derived from the token.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch the saved-article listing into local storage
    Fetch {
        /// Stop once this many articles are on disk
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Download page content and images for fetched articles
    Download {
        /// Specific article ids (all known articles when omitted)
        ids: Vec<String>,
    },

    /// Show fetch/download progress and rate-limit state
    Status,

    /// Discard the oldest rate-window timestamps to speed up a fresh run
    Boost {
        /// How many timestamps to discard (bounded by the limiter)
        #[arg(default_value_t = 10)]
        count: usize,
    },

    /// Delete all persisted state for this session
    Delete {
        /// Skip the confirmation requirement
        #[arg(long)]
        yes: bool,
    },
}

impl Args {
    /// Resolves the access token from the flag or the environment.
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var("READSTASH_TOKEN").ok())
            .filter(|token| !token.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_status_parses_with_defaults() {
        let args = Args::try_parse_from(["readstash", "status"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert_eq!(args.data_dir, PathBuf::from("./readstash-data"));
        assert_eq!(args.api_base, DEFAULT_API_BASE);
        assert!(matches!(args.command, Command::Status));
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["readstash", "-vv", "status"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_fetch_with_limit() {
        let args = Args::try_parse_from(["readstash", "fetch", "--limit", "50"]).unwrap();
        match args.command {
            Command::Fetch { limit } => assert_eq!(limit, Some(50)),
            other => panic!("expected fetch, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_download_collects_ids() {
        let args = Args::try_parse_from(["readstash", "download", "save-1", "save-2"]).unwrap();
        match args.command {
            Command::Download { ids } => assert_eq!(ids, vec!["save-1", "save-2"]),
            other => panic!("expected download, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_delete_requires_explicit_yes_flag_to_set() {
        let args = Args::try_parse_from(["readstash", "delete"]).unwrap();
        match args.command {
            Command::Delete { yes } => assert!(!yes),
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_token_flag_overrides_env() {
        let args =
            Args::try_parse_from(["readstash", "--token", "tok-flag", "status"]).unwrap();
        assert_eq!(args.resolve_token().as_deref(), Some("tok-flag"));
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        // --help causes early exit, so we check it returns an error with Help kind
        let result = Args::try_parse_from(["readstash", "--help"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_unknown_subcommand_errors() {
        let result = Args::try_parse_from(["readstash", "sync"]);
        assert!(result.is_err());
    }
}
