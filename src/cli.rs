use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::protocol;
use crate::token::TokenService;

#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "Pairing relay server for remote browser control")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mint a fresh device id and signed token for manual testing
    GenerateToken {
        /// Role to note alongside the credentials
        #[arg(long, default_value = "controller")]
        mode: String,
    },
}

/// Print a device id and a matching token signed with the configured secret.
pub fn generate_token(config: &Config, mode: &str) -> Result<()> {
    let tokens = TokenService::new(config.secret.as_bytes(), config.token_ttl_seconds);
    let device_id = protocol::generate_device_id();
    let token = tokens.issue(&device_id)?;

    println!("device id: {device_id}");
    println!("mode:      {mode}");
    println!("token:     {token}");
    Ok(())
}
