//! deskvox-control - CLI control utility for the deskvox daemon
//!
//! Talks to the running assistant over the session bus.

use clap::{Parser, Subcommand};
use zbus::blocking::Connection;

/// CLI control utility for the deskvox daemon
#[derive(Parser)]
#[command(name = "deskvox-control")]
#[command(author = "StarTuz")]
#[command(version)]
#[command(about = "Control utility for the deskvox voice assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check service health
    Ping,

    /// Get daemon version
    Version,

    /// Show assistant status
    Status,

    /// Start listening for a command as if the wake phrase was heard
    Activate,

    /// Run a typed command through the assistant
    Say {
        /// Command text, e.g. "open firefox"
        text: Vec<String>,
    },

    /// Ask the assistant to shut down
    Shutdown,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let conn = Connection::session()?;

    let dest = "org.deskvox.Assistant";
    let path = "/org/deskvox/Assistant";
    let iface = "org.deskvox.Assistant";

    match cli.command {
        Commands::Ping => {
            let result: String = conn
                .call_method(Some(dest), path, Some(iface), "Ping", &())?
                .body()
                .deserialize()?;
            println!("{}", result);
        }

        Commands::Version => {
            let result: String = conn
                .call_method(Some(dest), path, Some(iface), "GetVersion", &())?
                .body()
                .deserialize()?;
            println!("deskvox {}", result);
        }

        Commands::Status => {
            let (lifecycle, processing, should_exit, queued, listening, streak): (
                String,
                bool,
                bool,
                u32,
                bool,
                u32,
            ) = conn
                .call_method(Some(dest), path, Some(iface), "GetStatus", &())?
                .body()
                .deserialize()?;

            println!("deskvox Status");
            println!("──────────────");
            println!("State:        {}", lifecycle);
            println!("Processing:   {}", if processing { "Yes" } else { "No" });
            println!("Exiting:      {}", if should_exit { "Yes" } else { "No" });
            println!("Queued:       {}", queued);
            println!("Listening:    {}", if listening { "Yes" } else { "No" });
            println!("Wake streak:  {}", streak);
        }

        Commands::Activate => {
            let accepted: bool = conn
                .call_method(Some(dest), path, Some(iface), "Activate", &())?
                .body()
                .deserialize()?;
            if accepted {
                println!("Listening...");
            } else {
                println!("Assistant is busy or not running");
            }
        }

        Commands::Say { text } => {
            let text = text.join(" ");
            let (queued, message): (bool, String) = conn
                .call_method(Some(dest), path, Some(iface), "SubmitCommand", &text)?
                .body()
                .deserialize()?;
            if queued {
                println!("✓ {}", message);
            } else {
                println!("✗ {}", message);
            }
        }

        Commands::Shutdown => {
            let _: () = conn
                .call_method(Some(dest), path, Some(iface), "Shutdown", &())?
                .body()
                .deserialize()?;
            println!("Shutdown requested");
        }
    }

    Ok(())
}
