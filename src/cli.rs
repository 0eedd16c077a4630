use clap::{Parser, Subcommand};

/// tokensync: shared token lifecycle state for gateway nodes
#[derive(Parser)]
#[command(name = "tokensync", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node: persistence scheduler plus health and metrics endpoints
    Serve {
        /// Admin port to bind (overrides TOKENSYNC_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// One-shot token state operations against the configured store
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Alias helpers
    Alias {
        #[command(subcommand)]
        command: AliasCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Record a token and persist it immediately
    Add {
        /// Token id (a random UUID when omitted)
        #[arg(long)]
        token_id: Option<String>,
        /// Lifetime from now, in seconds
        #[arg(long, default_value = "3600")]
        ttl: u64,
        /// Absolute max lifetime, epoch milliseconds
        #[arg(long)]
        max_lifetime: Option<i64>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Extend a token's expiration
    Renew {
        #[arg(long)]
        token_id: String,
        /// Extension from now, in milliseconds
        #[arg(long, default_value = "3600000")]
        extension_ms: i64,
    },
    /// Print the persisted state of a token
    Show {
        #[arg(long)]
        token_id: String,
    },
}

#[derive(Subcommand)]
pub enum AliasCommands {
    /// Print the log-safe form of an alias name
    Display { alias: String },
}
