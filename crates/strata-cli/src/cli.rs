use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use strata_backend::StorageClass;
use strata_types::{DeletionSelector, MimeType, StoragePath};

#[derive(Parser)]
#[command(
    name = "strata",
    about = "strata: versioned, deduplicating element storage",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Store configuration file
    #[arg(short, long, global = true, default_value = "strata.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store an element from a file, URI or stdin
    Put(PutArgs),
    /// Write a stored element to a file or stdout
    Get(GetArgs),
    /// Make a path refer to another path's element
    Copy(CopyArgs),
    /// Check whether a path is stored
    Contains(PathArgs),
    /// Delete one version, or all versions, of a media package
    Delete(DeleteArgs),
    /// Show backend capacity
    Space,
    /// Show the object key behind a path
    Key(PathArgs),
    /// Show or change the storage class of an element
    StorageClass(StorageClassArgs),
    /// Restore a frozen element, or show its restore state
    Restore(RestoreArgs),
    /// Rewrite the mapping journal without deleted rows
    Compact,
}

#[derive(Args)]
pub struct PutArgs {
    /// Storage path, `org/mediapackage/version/element`
    pub path: StoragePath,
    /// File path or URI; `-` reads stdin
    pub source: String,
    /// Extension for the stored object, overriding the source's
    #[arg(long)]
    pub extension: Option<String>,
    #[arg(long)]
    pub mime_type: Option<MimeType>,
}

#[derive(Args)]
pub struct GetArgs {
    pub path: StoragePath,
    /// Output file; stdout when absent
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct CopyArgs {
    pub from: StoragePath,
    pub to: StoragePath,
}

#[derive(Args)]
pub struct PathArgs {
    pub path: StoragePath,
}

#[derive(Args)]
pub struct DeleteArgs {
    /// `org/mediapackage/version`, or `org/mediapackage/*` for every version
    pub selector: DeletionSelector,
}

#[derive(Args)]
pub struct StorageClassArgs {
    pub path: StoragePath,
    /// Move the element to this class
    #[arg(long)]
    pub set: Option<StorageClass>,
}

#[derive(Args)]
pub struct RestoreArgs {
    pub path: StoragePath,
    /// Days the restored copy stays readable
    #[arg(long)]
    pub days: Option<u32>,
    /// Only report the restore state
    #[arg(long, conflicts_with = "days")]
    pub status: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_put() {
        let cli = Cli::try_parse_from(["strata", "put", "org1/mp1/1/elA", "/tmp/fileX.mp4"]).unwrap();
        if let Command::Put(args) = cli.command {
            assert_eq!(args.path, StoragePath::new("org1", "mp1", 1, "elA").unwrap());
            assert_eq!(args.source, "/tmp/fileX.mp4");
            assert!(args.extension.is_none());
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_put_with_hints() {
        let cli = Cli::try_parse_from([
            "strata", "put", "org1/mp1/1/elA", "-", "--extension", "mp4", "--mime-type", "video/mp4",
        ]).unwrap();
        if let Command::Put(args) = cli.command {
            assert_eq!(args.source, "-");
            assert_eq!(args.extension, Some("mp4".into()));
            assert_eq!(args.mime_type.unwrap().to_string(), "video/mp4");
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_rejects_bad_path() {
        assert!(Cli::try_parse_from(["strata", "get", "org1/mp1/elA"]).is_err());
        assert!(Cli::try_parse_from(["strata", "get", "org1/mp1/x/elA"]).is_err());
    }

    #[test]
    fn parse_copy() {
        let cli = Cli::try_parse_from(["strata", "copy", "org1/mp1/1/elA", "org1/mp1/2/elA"]).unwrap();
        if let Command::Copy(args) = cli.command {
            assert_eq!(args.to, args.from.at_version(2));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_delete_selectors() {
        let cli = Cli::try_parse_from(["strata", "delete", "org1/mp1/2"]).unwrap();
        if let Command::Delete(args) = cli.command {
            assert_eq!(args.selector.selected_version(), Some(2u64.into()));
        } else { panic!("wrong command"); }

        let cli = Cli::try_parse_from(["strata", "delete", "org1/mp1/*"]).unwrap();
        if let Command::Delete(args) = cli.command {
            assert_eq!(args.selector.selected_version(), None);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_storage_class() {
        let cli = Cli::try_parse_from(["strata", "storage-class", "org1/mp1/1/elA", "--set", "glacier"]).unwrap();
        if let Command::StorageClass(args) = cli.command {
            assert_eq!(args.set, Some(StorageClass::Glacier));
        } else { panic!("wrong command"); }

        // Only classes a change may target are accepted.
        assert!(Cli::try_parse_from(["strata", "storage-class", "org1/mp1/1/elA", "--set", "outposts"]).is_err());
    }

    #[test]
    fn parse_restore() {
        let cli = Cli::try_parse_from(["strata", "restore", "org1/mp1/1/elA", "--days", "7"]).unwrap();
        if let Command::Restore(args) = cli.command {
            assert_eq!(args.days, Some(7));
            assert!(!args.status);
        } else { panic!("wrong command"); }
        assert!(Cli::try_parse_from(["strata", "restore", "org1/mp1/1/elA", "--days", "7", "--status"]).is_err());
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::try_parse_from(["strata", "space", "-v", "--format", "json", "-c", "/etc/strata.toml"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.format, OutputFormat::Json));
        assert_eq!(cli.config, PathBuf::from("/etc/strata.toml"));
    }

    #[test]
    fn parse_compact() {
        let cli = Cli::try_parse_from(["strata", "compact"]).unwrap();
        assert!(matches!(cli.command, Command::Compact));
        assert_eq!(cli.config, PathBuf::from("strata.toml"));
    }
}
