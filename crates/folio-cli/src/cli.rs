use clap::{Parser, Subcommand};

/// CLI surface definition: operator commands for session keys and masked ids.
#[derive(Parser, Debug)]
#[command(
    name = "folio",
    about = "Session key ring and masked-id tooling for the Folio gallery",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Check the key ring and a full cookie session cycle.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Inspect or rotate session keys.
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Maintain stored sessions.
    #[command(subcommand)]
    Sessions(SessionsCommand),
    /// Mask an integer id into an opaque token.
    Mask { id: u64 },
    /// Recover the id behind a masked token.
    Unmask { token: String },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum KeysCommand {
    /// List keys, newest first.
    List,
    /// Rotate the active key if it is older than the rotation interval.
    Rotate {
        /// Rotate even if the newest key is still fresh.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SessionsCommand {
    /// Delete sessions idle for longer than the configured maximum.
    Gc,
}
