//! `locks list` and `locks reclaim`

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use stepflow::LockService;

use super::StateStores;
use crate::Context;
use crate::ui;

pub fn list(_ctx: &Context, json: bool) -> Result<()> {
    let stores = StateStores::open()?;
    let leases = stores.locks.leases()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&leases)?);
        return Ok(());
    }
    if leases.is_empty() {
        ui::info("No leases held");
        return Ok(());
    }

    let now = Utc::now();
    ui::header(&format!("Leases ({})", leases.len()));
    for lease in &leases {
        let state = if lease.is_expired(now) {
            "expired".red()
        } else {
            "live".green()
        };
        println!(
            "  {:<32} {:<28} {} {}",
            lease.key,
            lease.holder,
            lease.expires_at.format("%H:%M:%S").to_string().dimmed(),
            state
        );
    }
    Ok(())
}

pub fn reclaim(ctx: &Context) -> Result<()> {
    let stores = StateStores::open()?;
    let removed = stores.locks.reclaim_expired()?;
    for lease in &removed {
        log::info!("reclaimed {} from {}", lease.key, lease.holder);
    }
    if !ctx.quiet {
        if removed.is_empty() {
            ui::info("No expired leases");
        } else {
            ui::success(&format!("Reclaimed {} expired lease(s)", removed.len()));
        }
    }
    Ok(())
}
