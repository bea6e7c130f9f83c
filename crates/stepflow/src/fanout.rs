//! Run the same operation on many hosts in parallel
//!
//! Every host is attempted and every result collected before the caller
//! decides anything. Partial failure comes back as a typed per-host list.

use crate::error::{Error, HostFailure, Result};
use rayon::prelude::*;

/// Per-host results of one fan-out
#[derive(Debug)]
pub struct FanOutReport<T> {
    /// Successful hosts with their values, in input order
    pub succeeded: Vec<(String, T)>,
    /// Failed hosts, in input order
    pub failures: Vec<HostFailure>,
}

impl<T> FanOutReport<T> {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// All values if every host succeeded, else [`Error::HostFailures`]
    pub fn into_result(self, step: &str) -> Result<Vec<(String, T)>> {
        if self.failures.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(Error::HostFailures {
                step: step.to_string(),
                failures: self.failures,
            })
        }
    }
}

/// Execute `op` once per host with at most `jobs` hosts in flight
pub fn fan_out<T, F>(hosts: &[String], jobs: usize, op: F) -> FanOutReport<T>
where
    T: Send,
    F: Fn(&str) -> Result<T> + Sync,
{
    let results: Vec<(String, Result<T>)> = if jobs <= 1 || hosts.len() <= 1 {
        hosts.iter().map(|h| (h.clone(), op(h))).collect()
    } else {
        execute_parallel(hosts, jobs, &op)
    };

    let mut report = FanOutReport {
        succeeded: Vec::with_capacity(results.len()),
        failures: Vec::new(),
    };
    for (host, result) in results {
        match result {
            Ok(value) => report.succeeded.push((host, value)),
            Err(e) => {
                log::debug!("{}: {}", host, e);
                report.failures.push(HostFailure::from_error(host, &e));
            }
        }
    }
    report
}

fn execute_parallel<T, F>(hosts: &[String], jobs: usize, op: &F) -> Vec<(String, Result<T>)>
where
    T: Send,
    F: Fn(&str) -> Result<T> + Sync,
{
    match rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.min(hosts.len()))
        .thread_name(|i| format!("fanout-{i}"))
        .build()
    {
        Ok(pool) => pool.install(|| {
            hosts
                .par_iter()
                .map(|h| (h.clone(), op(h)))
                .collect()
        }),
        Err(e) => {
            log::warn!("Failed to create thread pool ({}), running sequentially", e);
            hosts.iter().map(|h| (h.clone(), op(h))).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hosts(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("vm{i:02}")).collect()
    }

    #[test]
    fn test_all_succeed_in_order() {
        let report = fan_out(&hosts(6), 3, |h| Ok(h.len()));
        assert!(report.is_success());
        let names: Vec<&str> = report.succeeded.iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(names, ["vm01", "vm02", "vm03", "vm04", "vm05", "vm06"]);
    }

    #[test]
    fn test_every_host_attempted_despite_failures() {
        let calls = AtomicUsize::new(0);
        let report = fan_out(&hosts(5), 4, |h| {
            calls.fetch_add(1, Ordering::SeqCst);
            if h == "vm02" || h == "vm04" {
                Err(Error::HostUnreachable {
                    host: h.to_string(),
                    message: "no route".into(),
                })
            } else {
                Ok(())
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(report.succeeded.len(), 3);
        let failed: Vec<&str> = report.failures.iter().map(|f| f.host.as_str()).collect();
        assert_eq!(failed, ["vm02", "vm04"]);

        let err = report.into_result("create-user").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientRemote);
    }

    #[test]
    fn test_sequential_when_single_job() {
        let report = fan_out(&hosts(3), 1, |h| {
            if h == "vm03" {
                Err(Error::step_failed("x", "bad"))
            } else {
                Ok(h.to_uppercase())
            }
        });
        assert_eq!(report.succeeded[0].1, "VM01");
        assert_eq!(report.failures[0].kind, ErrorKind::FatalStep);
    }

    #[test]
    fn test_empty_host_list() {
        let report = fan_out::<(), _>(&[], 8, |_| Ok(()));
        assert!(report.is_success());
        assert!(report.into_result("noop").unwrap().is_empty());
    }
}
