use clap::{Parser, Subcommand};

use popstage_lib::config::EngineConfig;
use popstage_lib::ServeOptions;

#[derive(Parser)]
#[command(name = "popstage", about = "Peer-to-peer stage for a live elimination dating game")]
struct Cli {
    /// Round length in seconds
    #[arg(long, global = true, default_value = "60")]
    round_secs: u64,

    /// Give up on sessions stuck connecting after this many seconds
    #[arg(long, global = true)]
    connect_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine behind the local HTTP/WebSocket API
    Serve {
        /// API server port
        #[arg(long, default_value = "9847")]
        port: u16,

        /// Start hosting right away
        #[arg(long)]
        host: bool,

        /// In-process contestants to send to our own lobby (needs --host)
        #[arg(long, default_value = "0")]
        bots: usize,
    },
    /// Host a scripted game against in-process bots and log the board
    Demo {
        #[arg(long, default_value = "7")]
        bots: usize,
    },
}

fn main() {
    let cli = Cli::parse();
    popstage_lib::init_tracing();

    let config = EngineConfig {
        round_length: std::time::Duration::from_secs(cli.round_secs),
        connect_timeout: cli.connect_timeout_secs.map(std::time::Duration::from_secs),
        ..Default::default()
    };

    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    match cli.command {
        Command::Serve { port, host, bots } => {
            let opts = ServeOptions { port, host, bots };
            if let Err(e) = rt.block_on(popstage_lib::run_server(opts, config)) {
                eprintln!("API server error: {}", e);
                std::process::exit(1);
            }
        }
        Command::Demo { bots } => {
            if let Err(e) = rt.block_on(popstage_lib::run_demo(bots, config)) {
                eprintln!("Demo failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
