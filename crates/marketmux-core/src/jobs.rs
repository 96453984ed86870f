//! Serialization of long-running batch jobs.
//!
//! The persisted [`JobStatus`] record is the mutual-exclusion mechanism and
//! the only source of truth for a job's outcome; there is no in-memory flag
//! that could desynchronize from it. `try_start` rides the warehouse's
//! transactional conditional update, so two concurrent triggers for the
//! same id can never both be granted. Accepted job bodies run
//! fire-and-forget: the trigger only learns that the run was accepted, and
//! failures are recorded as ERROR rather than crashing the serving process.

use std::fmt::Display;
use std::future::Future;

use marketmux_warehouse::{JobRow, JobStatus, Warehouse, WarehouseError};
use thiserror::Error;
use tracing::{info, warn};

use crate::UtcDateTime;

#[derive(Debug, Error)]
pub enum JobError {
    /// A RUNNING record already exists for this job id.
    #[error("job '{0}' is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Storage(#[from] WarehouseError),
}

/// Coordinator granting at most one concurrent run per logical job id.
#[derive(Clone)]
pub struct JobCoordinator {
    warehouse: Warehouse,
}

impl JobCoordinator {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    /// Atomically transition the job to RUNNING, refusing when a run is
    /// already in flight.
    pub fn try_start(&self, job_id: &str) -> Result<(), JobError> {
        let granted = self
            .warehouse
            .job_try_start(job_id, UtcDateTime::now().unix_seconds())?;
        if granted {
            Ok(())
        } else {
            Err(JobError::AlreadyRunning(job_id.to_owned()))
        }
    }

    /// Claim the job id and run `job` fire-and-forget.
    ///
    /// Returns as soon as the run is accepted; the body's outcome is
    /// persisted as DONE or ERROR and observed only through [`Self::status`].
    pub fn spawn<F, E>(&self, job_id: &str, job: F) -> Result<(), JobError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        self.try_start(job_id)?;

        let warehouse = self.warehouse.clone();
        let id = job_id.to_owned();
        tokio::spawn(async move {
            let status = match job.await {
                Ok(()) => {
                    info!(job = %id, "job finished");
                    JobStatus::Done
                }
                Err(error) => {
                    warn!(job = %id, %error, "job failed");
                    JobStatus::Error
                }
            };

            let finished_at = UtcDateTime::now().unix_seconds();
            if let Err(error) = warehouse.job_finish(&id, status, finished_at) {
                warn!(job = %id, %error, "failed to persist job outcome");
            }
        });

        Ok(())
    }

    /// Read the persisted state for a job id.
    pub fn status(&self, job_id: &str) -> Result<Option<JobRow>, JobError> {
        Ok(self.warehouse.job_get(job_id)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use marketmux_warehouse::WarehouseConfig;

    use super::*;

    fn temp_coordinator() -> (tempfile::TempDir, JobCoordinator) {
        let dir = tempfile::tempdir().expect("tempdir");
        let warehouse = Warehouse::open(WarehouseConfig {
            db_path: dir.path().join("jobs.duckdb"),
            max_pool_size: 2,
        })
        .expect("open warehouse");
        (dir, JobCoordinator::new(warehouse))
    }

    async fn wait_for_status(
        coordinator: &JobCoordinator,
        job_id: &str,
        expected: JobStatus,
    ) -> JobRow {
        for _ in 0..100 {
            if let Some(row) = coordinator.status(job_id).expect("status read") {
                if row.status == expected {
                    return row;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job '{job_id}' never reached {expected:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_start_is_refused_while_running() {
        let (_dir, coordinator) = temp_coordinator();

        coordinator.try_start("screener:sp500").expect("first grant");
        let err = coordinator
            .try_start("screener:sp500")
            .expect_err("second must be refused");
        assert!(matches!(err, JobError::AlreadyRunning(_)));

        // A different id is an independent resource.
        coordinator.try_start("daily").expect("other id grants");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_body_persists_done() {
        let (_dir, coordinator) = temp_coordinator();

        coordinator
            .spawn("daily", async { Ok::<(), String>(()) })
            .expect("accepted");

        let row = wait_for_status(&coordinator, "daily", JobStatus::Done).await;
        assert!(row.finished_at.is_some());

        // A finished job can be started again.
        coordinator.try_start("daily").expect("restart grants");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_body_persists_error_without_crashing() {
        let (_dir, coordinator) = temp_coordinator();

        coordinator
            .spawn("screener:faulty", async {
                Err::<(), String>(String::from("universe fetch failed"))
            })
            .expect("accepted");

        wait_for_status(&coordinator, "screener:faulty", JobStatus::Error).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spawn_refuses_while_body_is_still_running() {
        let (_dir, coordinator) = temp_coordinator();

        coordinator
            .spawn("slow", async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), String>(())
            })
            .expect("accepted");

        let err = coordinator
            .spawn("slow", async { Ok::<(), String>(()) })
            .expect_err("second spawn must be refused");
        assert!(matches!(err, JobError::AlreadyRunning(_)));

        wait_for_status(&coordinator, "slow", JobStatus::Done).await;
    }
}
