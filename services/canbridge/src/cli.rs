//! Command-line interface

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use crate::can::CanId;
use crate::config::BridgeConfig;
use crate::control::{Command, ControlClient};
use crate::error::Result;

/// CAN bridge between two interfaces with a mutable blocklist
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "canbridge", version, about)]
pub struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Log level or filter (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// CAN IDs to block at startup, hexadecimal (e.g. --block 0x123 456)
    #[arg(long, num_args = 0.., value_parser = CanId::parse_hex)]
    pub block: Vec<CanId>,

    /// Block IDs on the running instance, then exit
    #[arg(long, num_args = 1.., value_parser = CanId::parse_hex)]
    pub update_block: Vec<CanId>,

    /// Unblock IDs on the running instance, then exit
    #[arg(long, num_args = 1.., value_parser = CanId::parse_hex)]
    pub unblock: Vec<CanId>,

    /// Control socket address
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Do not read commands from stdin
    #[arg(long)]
    pub no_prompt: bool,

    /// Use the interfaces as they are instead of resetting them with `ip link`
    #[arg(long)]
    pub no_interface_setup: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Args {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut BridgeConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(listen) = self.listen {
            config.control.listen = listen;
        }
        if self.no_prompt {
            config.control.interactive = false;
        }
        if self.no_interface_setup {
            config.interfaces.manage = false;
        }
        for id in &self.block {
            if !config.filter.blocked.contains(id) {
                config.filter.blocked.push(*id);
            }
        }
    }

    /// Load the layered configuration and apply overrides
    pub fn load_config(&self) -> Result<BridgeConfig> {
        let mut config = BridgeConfig::load(self.config.as_deref())?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Commands for `--update-block`/`--unblock`, empty when neither was given
    pub fn batch_commands(&self) -> Vec<Command> {
        self.update_block
            .iter()
            .map(|id| Command::Block(*id))
            .chain(self.unblock.iter().map(|id| Command::Unblock(*id)))
            .collect()
    }
}

/// Send blocklist updates to a running instance and return its replies
pub async fn run_batch(addr: SocketAddr, commands: &[Command]) -> Result<Vec<String>> {
    info!("Sending {} update(s) to {}", commands.len(), addr);
    let mut client = ControlClient::connect(addr).await?;

    let mut replies = Vec::with_capacity(commands.len());
    for command in commands {
        replies.push(client.request_line(&command.to_string()).await?);
    }
    Ok(replies)
}
