mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use vatproof::config::Config;
use vatproof::observability::init_tracing;
use vatproof::validator;

type AnyError = Box<dyn std::error::Error + Send + Sync>;

fn load_config(cli: &Cli) -> Result<Config, AnyError> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path.clone())?,
        None => Config::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    init_tracing(&config.telemetry.log_level);

    match cli.command {
        Commands::Server(args) => {
            if let Some(address) = args.address {
                config.server.bind_addr = address;
            }
            vatproof::api::run(config).await?;
        }
        Commands::Validate(args) => {
            let content = std::fs::read_to_string(&args.file)?;
            let report = validator::validate(content.lines());
            if args.text {
                let source = args.file.display().to_string();
                print!("{}", report.render_text(Some(&source)));
            } else {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Commands::Countries => {
            for (code, name) in validator::supported_countries() {
                println!("{code}  {name}");
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
