//! `reset`: forget completion records of a cluster

use anyhow::Result;
use dialoguer::Confirm;
use stepflow::CompletionLedger;

use super::StateStores;
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context, cluster_id: &str, yes: bool) -> Result<()> {
    let stores = StateStores::open()?;
    let records = stores.ledger.records(cluster_id)?;
    if records.is_empty() {
        ui::info(&format!("No completion records for {cluster_id}"));
        return Ok(());
    }

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Forget {} record(s) of {}? The next run repeats every step",
                records.len(),
                cluster_id
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            ui::info("Cancelled");
            return Ok(());
        }
    }

    stores.ledger.reset(cluster_id)?;
    log::info!("reset ledger of {} ({} records)", cluster_id, records.len());
    if !ctx.quiet {
        ui::success(&format!("Forgot {} record(s) of {}", records.len(), cluster_id));
    }
    Ok(())
}
