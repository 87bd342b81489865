use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "forgeterm", version, about = "forgeterm SSH shell and SFTP client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Extra config layer applied on top of the user and project files.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub project: Option<PathBuf>,

    /// user@host[:port]; defaults to the [server] section of the config.
    #[arg(long, short = 't', global = true)]
    pub target: Option<String>,

    /// Private key used instead of password authentication.
    #[arg(long, short = 'i', global = true)]
    pub identity: Option<PathBuf>,

    #[arg(long, short = 'p', global = true)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive shell; lines typed on stdin are sent as commands.
    Shell {
        #[arg(long)]
        no_stats: bool,
    },
    Ls {
        path: Option<String>,
    },
    Get {
        #[arg(required = true)]
        remote: Vec<String>,
        #[arg(long, short = 'd', default_value = ".")]
        dest: PathBuf,
    },
    Put {
        #[arg(required = true)]
        local: Vec<PathBuf>,
        #[arg(long, short = 'd')]
        dest: Option<String>,
        #[arg(long)]
        overwrite: bool,
    },
    Cat {
        path: String,
    },
    /// Replaces a remote text file with the contents of a local one.
    Edit {
        path: String,
        #[arg(long)]
        from: PathBuf,
    },
    Mkdir {
        path: String,
    },
    Rm {
        path: String,
    },
    Mv {
        path: String,
        new_name: String,
    },
    Config {
        #[arg(long)]
        init: bool,
    },
}

impl Command {
    pub fn is_interactive(&self) -> bool {
        matches!(self, Command::Shell { .. })
    }
}
