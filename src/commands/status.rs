//! `status`: progress and completion records per cluster

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use stepflow::{CompletionLedger, CompletionRecord, CompletionState, ProgressStatus, ProgressStore};

use super::StateStores;
use crate::Context;
use crate::ui;

#[derive(Debug, Serialize)]
struct ClusterStatus {
    cluster_id: String,
    progress: Option<ProgressStatus>,
    records: Vec<CompletionRecord>,
}

impl ClusterStatus {
    fn done(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.state == CompletionState::Done)
            .count()
    }
}

fn collect(stores: &StateStores, cluster_id: Option<&str>) -> Result<Vec<ClusterStatus>> {
    let ids = match cluster_id {
        Some(id) => vec![id.to_string()],
        None => {
            let mut ids = stores.ledger.clusters()?;
            ids.extend(stores.progress.all()?.into_iter().map(|(id, _)| id));
            ids.sort();
            ids.dedup();
            ids
        }
    };

    ids.into_iter()
        .map(|id| -> Result<ClusterStatus> {
            Ok(ClusterStatus {
                progress: stores.progress.get_status(&id)?,
                records: stores.ledger.records(&id)?,
                cluster_id: id,
            })
        })
        .collect()
}

pub fn run(ctx: &Context, cluster_id: Option<&str>, json: bool) -> Result<()> {
    let stores = StateStores::open()?;
    let statuses = collect(&stores, cluster_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        ui::info("No clusters recorded yet");
        return Ok(());
    }

    for status in &statuses {
        ui::section(&status.cluster_id);
        match &status.progress {
            Some(p) => {
                ui::kv("phase", &p.phase);
                ui::kv("progress", &format!("{} {}%", ui::percent_bar(p.percent, 20), p.percent));
                ui::kv("detail", &p.detail);
                ui::kv("updated", &p.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string());
            }
            None => ui::dim("no progress reported"),
        }
        ui::kv(
            "sub-steps",
            &format!("{} done, {} pending", status.done(), status.records.len() - status.done()),
        );

        if ctx.verbose > 0 {
            for record in &status.records {
                let mark = match record.state {
                    CompletionState::Done => "done".green(),
                    CompletionState::Pending => "pending".yellow(),
                };
                println!("    {:<26} {:<28} {}", record.step, record.sub_step, mark);
            }
        }
    }
    Ok(())
}
