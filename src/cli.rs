use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vatproof")]
#[command(about = "Batch VAT number verification with proof archives", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $VATPROOF_CONFIG or config/vatproof.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API together with the verification workers
    Server(ServerArgs),
    /// Validate a file with one VAT number per line, without verifying anything
    Validate(ValidateArgs),
    /// List the supported country prefixes
    Countries,
    /// Print the resolved configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    /// Override `server.bind_addr`
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct ValidateArgs {
    /// Input file
    pub file: PathBuf,

    /// Print a plain-text report instead of JSON
    #[arg(long)]
    pub text: bool,
}
