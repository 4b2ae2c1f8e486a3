//! Ping command handler.

use color_eyre::Result;

use super::App;

impl App {
    /// Run the ping command.
    pub async fn run_ping(&self) -> Result<()> {
        let connection = self.connect().await?;

        connection
            .ping()
            .await
            .map_err(|e| color_eyre::eyre::eyre!("Ping failed: {}", e))?;

        tracing::info!("Database is reachable");
        Ok(())
    }
}
