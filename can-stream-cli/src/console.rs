//! Operator console
//!
//! Reads one command per line from stdin and drives the [`CanClient`].

use crate::config::StorageConfig;
use crate::storage;
use anyhow::{anyhow, bail, Context, Result};
use can_stream_logger::{format_payload, CanClient, VirtualBus};
use std::io::BufRead;
use std::str::FromStr;

pub const HELP: &str = "\
Commands:
  start | c            start (or resume) the listener
  stop  | p            pause the listener
  restart              stop then start the listener
  reconnect | r        open a new bus endpoint and rebind to it
  watch / unwatch      start / stop the watcher
  log / unlog          start / stop a logging session
  send <id> [bytes..]  send a frame, hex id and hex bytes (e.g. send 7DF 02 01 0C)
  status               print the client status as JSON
  snapshot             print the latest value of every watched ID
  help                 show this text
  quit | q             shut down and exit";

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
    Reconnect,
    Watch,
    Unwatch,
    Log,
    Unlog,
    Send { id: u32, data: Vec<u8> },
    Status,
    Snapshot,
    Help,
    Quit,
}

fn parse_hex_u32(token: &str) -> Result<u32> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u32::from_str_radix(digits, 16).with_context(|| format!("Invalid CAN ID: {}", token))
}

fn parse_hex_byte(token: &str) -> Result<u8> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u8::from_str_radix(digits, 16).with_context(|| format!("Invalid data byte: {}", token))
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let Some(word) = tokens.next() else {
            bail!("Empty command");
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "start" | "c" => Command::Start,
            "stop" | "p" => Command::Stop,
            "restart" => Command::Restart,
            "reconnect" | "r" => Command::Reconnect,
            "watch" => Command::Watch,
            "unwatch" => Command::Unwatch,
            "log" => Command::Log,
            "unlog" => Command::Unlog,
            "send" | "s" => {
                let id = tokens
                    .next()
                    .ok_or_else(|| anyhow!("Usage: send <id> [bytes..]"))
                    .and_then(parse_hex_u32)?;
                let data = tokens.by_ref().map(parse_hex_byte).collect::<Result<Vec<u8>>>()?;
                return Ok(Command::Send { id, data });
            }
            "status" => Command::Status,
            "snapshot" => Command::Snapshot,
            "help" | "h" | "?" => Command::Help,
            "quit" | "q" | "exit" => Command::Quit,
            other => bail!("Unknown command: {} (type 'help')", other),
        };

        if let Some(extra) = tokens.next() {
            bail!("Unexpected argument '{}' for {}", extra, word);
        }
        Ok(command)
    }
}

/// Whether the console keeps reading after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Binds console commands to a client and the bus it listens on
pub struct Console<'a> {
    client: &'a CanClient,
    bus: &'a VirtualBus,
    storage: &'a StorageConfig,
}

impl<'a> Console<'a> {
    pub fn new(client: &'a CanClient, bus: &'a VirtualBus, storage: &'a StorageConfig) -> Self {
        Self {
            client,
            bus,
            storage,
        }
    }

    /// Run one command; errors are for the operator, not fatal
    pub fn execute(&self, command: &Command) -> Result<Flow> {
        match command {
            Command::Start => {
                log::info!("Starting the listener...");
                self.client.start()?;
            }
            Command::Stop => {
                log::info!("Pausing the listener...");
                self.client.stop()?;
            }
            Command::Restart => {
                log::info!("Restarting the listener...");
                self.client.restart()?;
            }
            Command::Reconnect => {
                log::info!("Reconnecting...");
                let old = self.client.listener().channel();
                self.client.rebind(self.bus.connect())?;
                if let Some(channel) = old {
                    channel.shutdown();
                }
            }
            Command::Watch => self.client.start_watching()?,
            Command::Unwatch => {
                self.client.stop_watching()?;
            }
            Command::Log => {
                let sink = storage::open_log_sink(self.storage)?;
                self.client.start_logging(Box::new(sink))?;
            }
            Command::Unlog => self.client.stop_logging(),
            Command::Send { id, data } => {
                log::info!("Sending 0x{:X} [{}]", id, format_payload(data));
                self.client.send_message(*id, data)?;
            }
            Command::Status => {
                let status = serde_json::to_string_pretty(&self.client.status())?;
                println!("{}", status);
            }
            Command::Snapshot => {
                let row = self.client.snapshot();
                let registry = self.client.registry();
                for (entry, value) in registry.entries().iter().zip(&row.values) {
                    let shown = value.as_deref().map(format_payload).unwrap_or_else(|| "-".to_string());
                    println!("0x{:03X} {:<20} {}", entry.id, entry.desc, shown);
                }
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    /// Read commands until `quit` or end of input
    pub fn run(&self, input: impl BufRead) -> Result<()> {
        for line in input.lines() {
            let line = line.context("Failed to read from stdin")?;
            if line.trim().is_empty() {
                continue;
            }
            let command = match line.parse::<Command>() {
                Ok(command) => command,
                Err(e) => {
                    eprintln!("{}", e);
                    continue;
                }
            };
            match self.execute(&command) {
                Ok(Flow::Quit) => return Ok(()),
                Ok(Flow::Continue) => {}
                Err(e) => log::error!("{}: {:#}", line.trim(), e),
            }
        }
        log::info!("End of input");
        Ok(())
    }
}
