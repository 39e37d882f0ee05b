use clap::{Parser, Subcommand};

/// keygate — time-limited license keys bound to hardware on first use
#[derive(Parser)]
#[command(name = "keygate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the validation server and the expiry sweeper
    Serve {
        /// Port to bind (defaults to KEYGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Run a single expiry sweep and exit
    Sweep,
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Generate a new random alphanumeric key
    Generate {
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        days: i64,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        hours: i64,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        minutes: i64,
        /// Key length, 8 to 64 characters
        #[arg(long, default_value_t = 64)]
        length: usize,
    },
    /// Remove a key
    Remove { key: String },
    /// Check whether a key is valid, without binding it
    Check { key: String },
    /// List all keys with expiration dates and bindings
    List,
    /// Reset the hardware id linked to a key
    ResetHwid { key: String },
}
