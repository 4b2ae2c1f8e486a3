//! Query command handler.

use color_eyre::Result;

use super::App;

impl App {
    /// Run a raw statement and print one JSON object per row.
    pub async fn run_query(&self, sql: &str) -> Result<()> {
        let connection = self.connect().await?;

        let rows = connection
            .query(sql)
            .await
            .map_err(|e| color_eyre::eyre::eyre!("Query failed: {}", e))?;

        for row in &rows {
            println!("{}", serde_json::to_string(row)?);
        }
        tracing::info!(rows = rows.len(), "Query complete");
        Ok(())
    }
}
