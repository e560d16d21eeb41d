mod cmd_team;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pi-teams", version, about = "Coordinate a team of autonomous coding agents")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Team coordination commands
    Team {
        #[command(subcommand)]
        cmd: cmd_team::TeamCommand,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Team { cmd } => cmd_team::run(cmd).await,
    }
}
