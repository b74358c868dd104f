//! Bridge console example
//!
//! Stands in for the control page's script: each line on stdin is one bridge
//! call, every event record is printed as it arrives.
//!
//! Run with: cargo run --example bridge_console
//!
//! Then type, for example:
//!   scan-start {"namePrefix":"Robo","timeoutMs":10000}
//!   connect {"peripheralId":"AA:BB:CC:DD:EE:FF"}
//!   send {"payload":"forward 10"}
//!   disconnect
//!
//! End input (Ctrl-D) to tear down.

use roboscratch_ble::{
    CommandBridge, DesktopHost, DesktopPlatform, LinkConfig, Mailbox, Renderer, Result,
    SessionManager,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

struct StdoutRenderer;

impl Renderer for StdoutRenderer {
    fn deliver(&self, record: String) {
        println!("<- {}", record);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,roboscratch_ble=info".into()),
        )
        .init();

    println!("RoboScratch Bridge Console");
    println!("==========================\n");
    println!("Commands: {}\n", roboscratch_ble::bridge::COMMANDS.join(", "));

    let config = match std::env::var("ROBOSCRATCH_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)
                .map_err(|e| roboscratch_ble::Error::Internal(format!("{}: {}", path, e)))?;
            LinkConfig::from_json(&json)?
        }
        Err(_) => LinkConfig::default(),
    };

    let mailbox = Mailbox::new();
    let platform = DesktopPlatform::new(mailbox.callbacks()).await?;
    let (manager, events) =
        SessionManager::spawn(mailbox, platform, DesktopHost, config.clone())?;
    let manager = Arc::new(manager);
    let bridge = CommandBridge::new(manager.clone(), events, StdoutRenderer, &config);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (name, args) = line.split_once(' ').unwrap_or((line, ""));
        println!("-> {}", bridge.invoke(name, args).await);
    }

    println!("\nShutting down...");
    manager.on_shell_teardown().await?;
    bridge.drained().await;

    Ok(())
}
