mod cmd;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ivee-run")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a flat binary into a fresh environment and call it once.
    Run(cmd::run::Cmd),
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(cmd) => cmd.execute(),
    };

    if let Err(e) = result {
        eprintln!("ivee-run: {e}");
        std::process::exit(1);
    }
}
