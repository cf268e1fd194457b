//! Interactive KV client binary.
//!
//! The loopback fabric is in-process, so the binary spawns the storage peer
//! at the requested address before connecting to it, then drives the same
//! numeric menu the store has always had.

use std::io::{self, BufRead};

use anyhow::Result;
use clap::Parser;
use kvdirect::session::{DEFAULT_ADDR, DEFAULT_PORT};
use kvdirect::{DbServer, KvClient, LoopbackFabric, ServerConfig, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "kv-client")]
#[command(about = "Interactive client for the fabric-attached KV store")]
struct Args {
    /// Server address
    #[arg(short = 's', long, default_value = DEFAULT_ADDR)]
    server: String,

    /// Port number
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Inline transmission - send messages without a registered send region
    #[arg(short = 'i', long)]
    inline: bool,

    /// Quiet mode - suppress response prints
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Read one integer from stdin, retrying on unparsable input. `None` means
/// end of input.
fn read_number(stdin: &io::Stdin, prompt: Option<&str>) -> Option<i32> {
    loop {
        if let Some(prompt) = prompt {
            println!("{prompt}");
        }
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).ok()? == 0 {
            return None;
        }
        match line.trim().parse() {
            Ok(n) => return Some(n),
            Err(_) => println!("Error parsing selection."),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.quiet {
        "warn"
    } else {
        args.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!("kv-client: start");

    let fabric = LoopbackFabric::new();
    let server = DbServer::bind(
        &fabric,
        ServerConfig {
            addr: args.server.clone(),
            port: args.port,
            ..Default::default()
        },
    )?;
    tokio::spawn(server.run());

    let config = SessionConfig {
        addr: args.server,
        port: args.port,
        inline_send: args.inline,
        ..Default::default()
    };
    let mut client = KvClient::connect(&fabric, &config).await?;

    let stdin = io::stdin();
    'menu: loop {
        println!();
        println!("Enter next command:");
        println!("  0 - disconnect and quit");
        println!("  1 - set key value pair");
        println!("  2 - query the value of a given key");
        println!("  3 - set key using a one-sided write");

        let Some(selection) = read_number(&stdin, None) else {
            break 'menu;
        };

        match selection {
            0 => break 'menu,
            1 => {
                let Some(key) = read_number(&stdin, Some("Enter key:")) else {
                    break 'menu;
                };
                let Some(value) = read_number(&stdin, Some("Enter value:")) else {
                    break 'menu;
                };
                match client.set(key, value).await {
                    Ok((key, value)) => {
                        if !args.quiet {
                            println!("Got set response: key={key}, value={value}");
                        }
                    }
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
            2 => {
                let Some(key) = read_number(&stdin, Some("Enter key:")) else {
                    break 'menu;
                };
                match client.query(key).await {
                    Ok((key, value)) => {
                        if !args.quiet {
                            println!("Got query response: key={key}, value={value}");
                        }
                    }
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
            3 => {
                let Some(key) = read_number(&stdin, Some("Enter key:")) else {
                    break 'menu;
                };
                let Some(value) = read_number(&stdin, Some("Enter value:")) else {
                    break 'menu;
                };
                match client.write_direct(key, value).await {
                    Ok(()) => {
                        if !args.quiet {
                            println!("One-sided write done: key={key}, value={value}");
                        }
                    }
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
            other => println!("Unknown selection: {other}"),
        }
    }

    client.disconnect().await?;
    tracing::info!("kv-client: end");
    Ok(())
}
