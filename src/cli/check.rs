//! Check command handler.

use color_eyre::Result;

use crate::app_context::ApplicationContext;

use super::demo::demo_module;
use super::App;

impl App {
    /// Validate the demo module and print its definitions in build order.
    pub async fn run_check(&self, json: bool) -> Result<()> {
        let (module, _) = demo_module();
        let app = ApplicationContext::builder(module).build()?;
        let summary = app.describe();

        if json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            for row in &summary {
                let deps = if row.depends_on.is_empty() {
                    "-".to_string()
                } else {
                    row.depends_on.join(", ")
                };
                println!("{:<20} {:<10} {}", row.name, row.scope, deps);
            }
        }

        tracing::info!("Module '{}' is valid ({} definitions)", app.module_name(), summary.len());
        app.shutdown().await?;
        Ok(())
    }
}
