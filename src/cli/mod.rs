//! CLI module for rowkeep.
//!
//! Subcommands:
//! - `ping`: Lease a pooled connection and run a trivial statement
//! - `query`: Run a raw SQL statement and print the rows as JSON

mod ping;
mod query;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use crate::config::Config;
use crate::connection::Connection;
use crate::schema::Schema;

/// rowkeep - entity repositories over PostgreSQL
#[derive(Parser)]
#[command(name = "rowkeep")]
#[command(about = "Entity repositories over PostgreSQL")]
#[command(version)]
pub struct App {
    /// Run in verbose mode
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check that the configured database is reachable
    Ping,

    /// Run a raw SQL statement and print the resulting rows as JSON
    Query {
        /// Statement to run
        sql: String,
    },
}

impl App {
    /// Run the CLI application.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Ping => self.run_ping().await,
            Command::Query { ref sql } => self.run_query(sql).await,
        }
    }

    /// Loads configuration and opens a connection with an empty schema.
    async fn connect(&self) -> Result<Connection> {
        let config = Config::load()?;
        tracing::debug!(pool_size = config.postgres.pool_size, "configuration loaded");

        let schema = Schema::builder().build()?;
        let connection = Connection::connect(&config.postgres, schema).await?;
        Ok(connection)
    }
}
