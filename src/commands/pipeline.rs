//! `run` and `undo`

use anyhow::{Context as _, Result, bail};
use chrono::Utc;
use colored::Colorize;
use dialoguer::Confirm;
use std::sync::Arc;
use stepflow::{
    ClusterContext, Direction, Driver, JsonLinesSink, PipelineResult, Profile, RunOptions,
    Services, StepKind, StepRegistry, Telemetry,
};

use super::StateStores;
use crate::Context;
use crate::cli::{PipelineArgs, RunArgs, UndoArgs};
use crate::config::{self, Settings};
use crate::paths;
use crate::session::{DryRunSession, SshSession};
use crate::ui;

pub fn run(ctx: &Context, args: RunArgs) -> Result<()> {
    let mut options = RunOptions::new(request_id(&args.pipeline));
    options.fresh = args.fresh;
    execute(ctx, &args.pipeline, Direction::Forward, options)
}

pub fn undo(ctx: &Context, args: UndoArgs) -> Result<()> {
    let mut options = RunOptions::new(request_id(&args.pipeline));
    options.force_undo = args.force;

    if !args.yes && !args.pipeline.dry_run {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Undo provisioning steps of {}? This deletes resources",
                args.pipeline.cluster
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            ui::info("Cancelled");
            return Ok(());
        }
    }
    execute(ctx, &args.pipeline, Direction::Undo, options)
}

fn request_id(args: &PipelineArgs) -> String {
    args.request_id
        .clone()
        .unwrap_or_else(|| format!("cf{}", Utc::now().format("%Y%m%d%H%M%S")))
}

/// Steps to run: the caller's list, or the profile table in `direction`
fn step_list(
    registry: &StepRegistry,
    args: &PipelineArgs,
    profile: Profile,
    direction: Direction,
) -> Result<Vec<String>> {
    if !args.steps.is_empty() {
        return Ok(args.steps.clone());
    }
    let table = registry.table(profile)?;
    let kinds: Vec<StepKind> = match direction {
        Direction::Forward => table.default_forward(),
        Direction::Undo => table.default_undo(),
    };
    Ok(kinds.iter().map(|k| k.as_str().to_string()).collect())
}

fn services(ctx: &Context, args: &PipelineArgs) -> Result<Services> {
    if args.dry_run {
        return Ok(Services::in_memory(Arc::new(DryRunSession::new(ctx.quiet))));
    }
    let stores = StateStores::open()?;
    Ok(Services {
        session: Arc::new(SshSession::new(args.ssh_user.clone())),
        progress: stores.progress,
        ledger: stores.ledger,
        locks: stores.locks,
        spans: Arc::new(JsonLinesSink::new(paths::spans_file(&stores.dir))),
    })
}

fn execute(
    ctx: &Context,
    args: &PipelineArgs,
    direction: Direction,
    mut options: RunOptions,
) -> Result<()> {
    let settings = Settings::load()?;
    for (key, value) in settings.entries() {
        log::debug!("setting {} = {}", key, value);
    }
    let mut cluster = config::load_cluster(&args.cluster)?;
    options.overrides = config::parse_overrides(&args.overrides)?;

    let registry = provision::registry().context("Failed to build step registry")?;
    let profile = match &args.profile {
        Some(name) => name.parse::<Profile>()?,
        None => detect_profile(&cluster, &options),
    };
    let steps = step_list(&registry, args, profile, direction)?;

    let mut driver = Driver::new(&registry, services(ctx, args)?, &settings)?;
    if !args.json && !ctx.quiet {
        ui::header(&format!(
            "{} {} ({}, {} step(s))",
            direction, cluster.cluster_id, profile, steps.len()
        ));
        if args.dry_run {
            ui::warn("Dry run: commands are printed, nothing is persisted");
        }
    }

    let result = driver.run_pipeline(&mut cluster, Some(profile), &steps, direction, &options);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(ctx, &result, driver.telemetry());
    }

    if !result.is_success() {
        bail!(
            "{} of {} failed at {}",
            direction,
            result.cluster_id,
            result.failed_step.as_deref().unwrap_or("validation")
        );
    }
    Ok(())
}

/// Same detection the driver does, after overrides are merged
fn detect_profile(cluster: &ClusterContext, options: &RunOptions) -> Profile {
    let mut preview = cluster.clone();
    preview.reconcile(&options.overrides);
    Profile::detect(&preview)
}

fn print_result(ctx: &Context, result: &PipelineResult, telemetry: &Telemetry) {
    let durations = telemetry.durations();
    let total = result.outcomes.len() + usize::from(result.failed_step.is_some());

    if !ctx.quiet {
        println!();
        for (i, done) in result.outcomes.iter().enumerate() {
            let took = durations
                .iter()
                .find(|(step, _)| *step == done.step)
                .map(|(_, d)| ui::format_duration(*d))
                .unwrap_or_default();
            let code = if done.outcome.return_code == 0 {
                String::new()
            } else {
                format!(" [rc={}]", done.outcome.return_code).yellow().to_string()
            };
            ui::step(
                i + 1,
                total,
                &format!("{} {}{} {}", done.step.as_str().bold(), done.outcome.message, code, took.dimmed()),
            );
            if !done.outcome.sub_steps.is_empty() && ctx.verbose > 0 {
                ui::dim(&done.outcome.sub_step_summary());
            }
            for failure in done.outcome.best_effort_failures() {
                ui::warn(&format!("{}: cleanup failed, continued", failure.name));
            }
        }
    }

    match (&result.failed_step, &result.error) {
        (step, Some(error)) => {
            ui::error(&format!(
                "{}: {} [{:#06x}] {}",
                step.as_deref().unwrap_or("request"),
                error.kind,
                error.code,
                error.message
            ));
            ui::dim(error.kind.advice());
            if !result.completed_steps.is_empty() {
                let done: Vec<&str> = result.completed_steps.iter().map(|s| s.as_str()).collect();
                ui::kv("completed", &done.join(", "));
            }
        }
        (_, None) => ui::success(&format!(
            "{} of {} complete ({} step(s))",
            result.direction,
            result.cluster_id,
            result.completed_steps.len()
        )),
    }
}
