use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Run commands and list directories on remote hosts over SSH.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON profile with connection defaults
    #[arg(long, global = true, value_name = "FILE")]
    pub profile: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub target: TargetArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Where to connect and how to authenticate. Every field overrides the
/// profile.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Remote host name or address
    #[arg(short = 'H', long, global = true)]
    pub host: Option<String>,

    /// Remote SSH port
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Login user
    #[arg(short, long, global = true)]
    pub user: Option<String>,

    /// Authenticate with this password (may be empty)
    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Authenticate with this private key file
    #[arg(short = 'i', long, global = true, value_name = "FILE")]
    pub key: Option<PathBuf>,

    /// Passphrase of the private key
    #[arg(long, global = true)]
    pub passphrase: Option<String>,

    /// Authenticate with the running ssh-agent
    #[arg(short = 'A', long, global = true)]
    pub agent: bool,

    /// Transport timeout in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    pub timeout_ms: Option<u32>,

    /// Negotiate transport compression
    #[arg(long, global = true)]
    pub compress: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a command and print its standard output
    Exec {
        /// Command line passed to the remote shell
        command: String,

        /// Strip the trailing newline of the output
        #[arg(long)]
        chomp: bool,
    },

    /// Run a command and forward its output and exit status
    Capture {
        /// Command line passed to the remote shell
        command: String,

        /// Merge standard error into standard output
        #[arg(long)]
        merge: bool,
    },

    /// Print the first lines of a command's output, then close the channel
    /// without draining the rest
    Head {
        /// Command line passed to the remote shell
        command: String,

        /// Number of lines to print
        #[arg(short = 'n', long, default_value_t = 10)]
        lines: usize,
    },

    /// List the authentication methods the server accepts
    Methods,

    /// Print the server host key fingerprint
    Fingerprint,

    /// List a remote directory over SFTP
    Ls {
        /// Directory to list, the login directory when omitted
        dir: Option<String>,

        /// Show mode and size columns
        #[arg(short, long)]
        long: bool,

        /// Print full paths instead of entry names
        #[arg(long, conflicts_with = "long")]
        paths: bool,
    },
}
