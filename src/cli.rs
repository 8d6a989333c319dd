/// CLI argument parsing for the backup tools

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::utils::{DB_LOG_FILE, DEFAULT_DB_CONFIG, DOCKER_LOG_FILE, LAUNCHER_LOG_FILE};

// Build timestamp injected at compile time
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

// Get version with timestamp
pub fn get_version() -> &'static str {
    VERSION_WITH_BUILD
}

/// Back up or restore Docker volumes and container snapshots
#[derive(Parser, Debug)]
#[command(name = "backup-dockers")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct DockerCli {
    /// Log file (appended to)
    #[arg(long, global = true, default_value = DOCKER_LOG_FILE)]
    pub log_file: PathBuf,

    #[command(subcommand)]
    pub command: DockerCommands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DockerCommands {
    /// Archive every configured volume, then snapshot every configured container
    Backup {
        /// JSON configuration document
        config: PathBuf,
    },

    /// Restore every configured volume and container from the backup directory
    Restore {
        /// JSON configuration document
        config: PathBuf,
    },
}

impl DockerCommands {
    pub fn config(&self) -> &PathBuf {
        match self {
            DockerCommands::Backup { config } | DockerCommands::Restore { config } => config,
        }
    }
}

/// Dump and restore MariaDB, PostgreSQL and MongoDB databases
#[derive(Parser, Debug)]
#[command(name = "db-backup")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct DbCli {
    /// JSON configuration document
    #[arg(short, long, global = true, default_value = DEFAULT_DB_CONFIG)]
    pub config: PathBuf,

    /// Log file (appended to)
    #[arg(long, global = true, default_value = DB_LOG_FILE)]
    pub log_file: PathBuf,

    #[command(subcommand)]
    pub command: DbCommands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DbCommands {
    /// Back up every configured database
    Backup,

    /// Restore one database from a backup file or directory
    Restore {
        /// Name of the database entry in the configuration
        name: String,

        /// Backup file (.sql, .dump) or MongoDB dump directory
        source: PathBuf,
    },

    /// List configured databases
    List,
}

/// Start `db-backup backup` in the background and report its status as JSON
#[derive(Parser, Debug)]
#[command(name = "backup-launcher")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct LauncherCli {
    /// Configuration passed through to db-backup
    #[arg(short, long, default_value = DEFAULT_DB_CONFIG)]
    pub config: PathBuf,

    /// File receiving the run's output
    #[arg(long, default_value = LAUNCHER_LOG_FILE)]
    pub log_file: PathBuf,

    /// db-backup binary (defaults to the one next to this executable)
    #[arg(long)]
    pub program: Option<PathBuf>,

    /// Stay attached and copy the run's output into the log until it finishes
    #[arg(short, long)]
    pub follow: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definitions_are_valid() {
        DockerCli::command().debug_assert();
        DbCli::command().debug_assert();
        LauncherCli::command().debug_assert();
    }

    #[test]
    fn test_docker_cli_parsing() {
        let cli = DockerCli::try_parse_from(["backup-dockers", "backup", "/etc/dockvault.json"]).unwrap();
        assert_eq!(cli.command.config(), &PathBuf::from("/etc/dockvault.json"));
        assert_eq!(cli.log_file, PathBuf::from("/tmp/backup-dockers.log"));

        assert!(DockerCli::try_parse_from(["backup-dockers", "restore"]).is_err());
        assert!(DockerCli::try_parse_from(["backup-dockers", "prune", "x.json"]).is_err());
    }

    #[test]
    fn test_db_cli_parsing() {
        let cli = DbCli::try_parse_from(["db-backup", "restore", "shop", "/backups/shop.sql"]).unwrap();
        assert_eq!(
            cli.command,
            DbCommands::Restore {
                name: "shop".to_string(),
                source: PathBuf::from("/backups/shop.sql"),
            }
        );
        assert_eq!(cli.config, PathBuf::from("config.json"));

        let cli = DbCli::try_parse_from(["db-backup", "list", "--config", "/etc/db.json"]).unwrap();
        assert_eq!(cli.command, DbCommands::List);
        assert_eq!(cli.config, PathBuf::from("/etc/db.json"));

        assert!(DbCli::try_parse_from(["db-backup", "restore", "shop"]).is_err());
    }
}
