use clap::{Parser, Subcommand};
use log::LevelFilter;
use miette::Result;

use arduflash::{
    cli::{self, config::Config, MonitorArgs, UploadArgs},
    logging,
};

#[derive(Debug, Parser)]
#[command(about, version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload a firmware artifact to a board
    Upload(UploadArgs),
    /// Open a serial monitor on a board
    Monitor(MonitorArgs),
    /// List connected USB serial ports
    ListPorts,
    /// List supported boards and their FQBNs
    ListBoards,
}

fn main() {
    logging::initialize_logger(LevelFilter::Info);

    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            1
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = Config::load()?;

    match cli.subcommand {
        Commands::Upload(args) => cli::upload(args, &config),
        Commands::Monitor(args) => cli::serial_monitor(args, &config).map(|()| 0),
        Commands::ListPorts => cli::list_ports().map(|()| 0),
        Commands::ListBoards => cli::list_boards().map(|()| 0),
    }
}
