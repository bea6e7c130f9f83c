//! Execution spans around every step invocation
//!
//! Telemetry observes and never steers: the wrapped call's result is
//! returned unchanged, and failing to persist a span is only logged.
//! Arguments and results are captured through a closed set of
//! [`Projection`]s so option values (passwords, keys) are never stored.

use crate::cluster::Direction;
use crate::error::{ErrorKind, Result};
use crate::step::StepKind;
use crate::types::StepOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Whitelisted view of a step invocation that may be stored on a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    /// First `n` entries of the invocation's step list
    StepListHead(usize),
    /// Return code of a successful invocation
    ReturnCode,
    /// Counts of ran/skipped/no-op/failed sub-steps
    SubStepSummary,
}

impl Projection {
    pub const DEFAULT: [Projection; 3] = [
        Projection::StepListHead(3),
        Projection::ReturnCode,
        Projection::SubStepSummary,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SpanOutcome {
    Ok { return_code: i32 },
    Err { kind: ErrorKind, code: u32, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSpan {
    pub thread: String,
    pub cluster_id: String,
    pub step: StepKind,
    pub direction: Direction,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<SpanOutcome>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl ExecutionSpan {
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Some(SpanOutcome::Ok { .. }))
    }
}

/// Destination for spans.
///
/// Every invocation reaches the sink twice: once through [`SpanSink::open`]
/// before the step runs (`ended_at` unset), then through
/// [`SpanSink::write`] when it returns. A step killed mid-way leaves only
/// the open span behind.
pub trait SpanSink: Send + Sync {
    /// A span whose invocation just started
    fn open(&self, span: &ExecutionSpan) -> Result<()> {
        self.write(span)
    }

    /// A completed span
    fn write(&self, span: &ExecutionSpan) -> Result<()>;
}

/// Sink that drops everything
pub struct NullSink;

impl SpanSink for NullSink {
    fn write(&self, _span: &ExecutionSpan) -> Result<()> {
        Ok(())
    }
}

/// Sink that keeps spans in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    spans: Mutex<Vec<ExecutionSpan>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<ExecutionSpan> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl MemorySink {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ExecutionSpan>>> {
        self.spans
            .lock()
            .map_err(|_| crate::error::Error::Store("span sink mutex poisoned".into()))
    }
}

/// Keeps one entry per invocation: the completed span replaces its open one
impl SpanSink for MemorySink {
    fn open(&self, span: &ExecutionSpan) -> Result<()> {
        self.lock()?.push(span.clone());
        Ok(())
    }

    fn write(&self, span: &ExecutionSpan) -> Result<()> {
        let mut spans = self.lock()?;
        let open = spans.iter_mut().rev().find(|s| {
            s.ended_at.is_none()
                && s.step == span.step
                && s.thread == span.thread
                && s.started_at == span.started_at
        });
        match open {
            Some(slot) => *slot = span.clone(),
            None => spans.push(span.clone()),
        }
        Ok(())
    }
}

/// Appends one JSON object per span to a file
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SpanSink for JsonLinesSink {
    fn write(&self, span: &ExecutionSpan) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(span)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Span recorder owned by one driver
pub struct Telemetry {
    sink: Arc<dyn SpanSink>,
    projections: Vec<Projection>,
    spans: Vec<ExecutionSpan>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn SpanSink>) -> Self {
        Self {
            sink,
            projections: Projection::DEFAULT.to_vec(),
            spans: Vec::new(),
        }
    }

    pub fn with_projections(mut self, projections: &[Projection]) -> Self {
        self.projections = projections.to_vec();
        self
    }

    /// Forget spans of a previous run so they are never counted twice
    pub fn flush(&mut self) {
        if !self.spans.is_empty() {
            log::debug!("Flushing {} span(s) from previous run", self.spans.len());
        }
        self.spans.clear();
    }

    /// Spans of the current run, in invocation order
    pub fn spans(&self) -> &[ExecutionSpan] {
        &self.spans
    }

    /// Run `f` inside a span and hand back its result untouched
    pub fn instrument<F>(
        &mut self,
        cluster_id: &str,
        step: StepKind,
        direction: Direction,
        step_list: &[StepKind],
        f: F,
    ) -> Result<StepOutcome>
    where
        F: FnOnce() -> Result<StepOutcome>,
    {
        let current = std::thread::current();
        let thread = current
            .name()
            .map_or_else(|| format!("{:?}", current.id()), str::to_string);

        let mut span = ExecutionSpan {
            thread,
            cluster_id: cluster_id.to_string(),
            step,
            direction,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            fields: BTreeMap::new(),
        };
        for projection in &self.projections {
            if let Projection::StepListHead(n) = projection {
                let head: Vec<&str> = step_list.iter().take(*n).map(StepKind::as_str).collect();
                span.fields.insert("step_list_head".into(), head.join(","));
            }
        }

        if let Err(e) = self.sink.open(&span) {
            log::warn!("Failed to persist start of {}: {}", step, e);
        }
        let result = f();

        span.ended_at = Some(Utc::now());
        match &result {
            Ok(outcome) => {
                span.outcome = Some(SpanOutcome::Ok {
                    return_code: outcome.return_code,
                });
                for projection in &self.projections {
                    match projection {
                        Projection::ReturnCode => {
                            span.fields
                                .insert("return_code".into(), outcome.return_code.to_string());
                        }
                        Projection::SubStepSummary if !outcome.sub_steps.is_empty() => {
                            span.fields
                                .insert("sub_steps".into(), outcome.sub_step_summary());
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                span.outcome = Some(SpanOutcome::Err {
                    kind: e.kind(),
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }

        if let Err(e) = self.sink.write(&span) {
            log::warn!("Failed to persist span for {}: {}", step, e);
        }
        self.spans.push(span);
        result
    }

    /// Per-step durations of the current run
    pub fn durations(&self) -> Vec<(StepKind, Duration)> {
        self.spans
            .iter()
            .filter_map(|s| s.duration().map(|d| (s.step, d)))
            .collect()
    }

    /// Log a duration summary of the current run
    pub fn report(&self) {
        if self.spans.is_empty() {
            return;
        }
        let total: Duration = self.durations().iter().map(|(_, d)| *d).sum();
        log::info!(
            "Executed {} step(s) in {:.1}s",
            self.spans.len(),
            total.as_secs_f64()
        );
        for span in &self.spans {
            let status = if span.succeeded() { "ok" } else { "failed" };
            log::info!(
                "  {:<28} {:>8.1}s  {}",
                span.step.as_str(),
                span.duration().unwrap_or_default().as_secs_f64(),
                status
            );
        }
    }
}
