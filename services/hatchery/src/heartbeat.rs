//! Heartbeat loop keeping the hatchery registration alive.
//!
//! Every tick refreshes the registration, registering first while the id is
//! zero. A failed refresh forgets the id so that the next tick registers
//! again. Only a successful refresh clears the failure counter. Sustained failure is the only fatal condition of the
//! engine: the loop returns an error and the process exits.

use std::sync::Arc;
use std::time::Duration;

use hatchery_sdk::JobServer;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::identity::Identity;

/// Heartbeat errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("{failures} consecutive heartbeat failures (max {max})")]
    TooManyFailures { failures: u32, max: u32 },
}

/// Registration keeper.
pub struct Heartbeat {
    job_server: Arc<dyn JobServer>,
    identity: Arc<Identity>,
    interval: Duration,
    max_failures: u32,
    consecutive_failures: u32,
}

impl Heartbeat {
    pub fn new(
        job_server: Arc<dyn JobServer>,
        identity: Arc<Identity>,
        interval: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            job_server,
            identity,
            interval,
            max_failures,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Run until shutdown or until failures exceed the tolerated count.
    #[instrument(skip(self, shutdown), fields(hatchery = %self.identity.name()))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), HeartbeatError> {
        info!(
            interval_secs = self.interval.as_secs(),
            max_failures = self.max_failures,
            "Starting heartbeat loop"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await?;
                }
                _ = shutdown.changed() => {
                    info!("Heartbeat loop shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// One heartbeat.
    pub async fn tick(&mut self) -> Result<(), HeartbeatError> {
        if !self.identity.is_registered() {
            self.register().await;
        }
        if self.identity.is_registered() {
            self.refresh().await;
        }

        if self.consecutive_failures > self.max_failures {
            error!(
                consecutive_failures = self.consecutive_failures,
                max_failures = self.max_failures,
                "Giving up on the job server"
            );
            return Err(HeartbeatError::TooManyFailures {
                failures: self.consecutive_failures,
                max: self.max_failures,
            });
        }
        Ok(())
    }

    async fn register(&mut self) {
        match self.job_server.register_hatchery(&self.identity.to_record()).await {
            Ok((registered, up_to_date)) => {
                if registered.id.is_unset() {
                    self.failed("job server returned no hatchery id");
                    return;
                }
                if !up_to_date {
                    warn!(version = %registered.version, "Hatchery version is outdated");
                }
                self.identity.set_id(registered.id);
                info!(hatchery_id = %registered.id, "Hatchery registered");
            }
            Err(e) => self.failed(&e.to_string()),
        }
    }

    async fn refresh(&mut self) {
        let id = self.identity.id();
        match self.job_server.refresh_hatchery(id).await {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    info!(
                        previous_failures = self.consecutive_failures,
                        "Heartbeat recovered"
                    );
                }
                self.consecutive_failures = 0;
                debug!(hatchery_id = %id, "Heartbeat acknowledged");
            }
            Err(e) => {
                self.identity.reset();
                self.failed(&e.to_string());
            }
        }
    }

    fn failed(&mut self, reason: &str) {
        self.consecutive_failures += 1;
        if self.consecutive_failures <= 3 {
            warn!(
                error = %reason,
                consecutive_failures = self.consecutive_failures,
                "Heartbeat failed"
            );
        } else {
            error!(
                error = %reason,
                consecutive_failures = self.consecutive_failures,
                "Heartbeat failed repeatedly"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatchery_sdk::HatcheryId;
    use hatchery_testing::FakeJobServer;

    use crate::config::Config;

    fn heartbeat(server: &Arc<FakeJobServer>, max_failures: u32) -> (Heartbeat, Arc<Identity>) {
        let identity = Arc::new(Identity::new(&Config::default(), "pk".to_string()));
        (
            Heartbeat::new(
                server.clone(),
                identity.clone(),
                Duration::from_secs(10),
                max_failures,
            ),
            identity,
        )
    }

    #[tokio::test]
    async fn test_registers_then_refreshes() {
        let server = Arc::new(FakeJobServer::new());
        server.set_assigned_id(7);
        let (mut hb, identity) = heartbeat(&server, 3);

        hb.tick().await.unwrap();
        assert_eq!(identity.id(), HatcheryId::new(7));
        assert_eq!(server.refresh_count(), 1);

        hb.tick().await.unwrap();
        assert_eq!(server.refresh_count(), 2);
        assert_eq!(hb.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_zero_id_counts_as_failure() {
        let server = Arc::new(FakeJobServer::new());
        server.set_assigned_id(0);
        let (mut hb, identity) = heartbeat(&server, 3);

        hb.tick().await.unwrap();
        assert!(!identity.is_registered());
        assert_eq!(hb.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_forces_registration() {
        let server = Arc::new(FakeJobServer::new());
        let (mut hb, identity) = heartbeat(&server, 3);

        hb.tick().await.unwrap();
        server.fail_refresh(true);
        hb.tick().await.unwrap();

        assert!(!identity.is_registered());
        assert_eq!(hb.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_failures_above_max_are_fatal() {
        let server = Arc::new(FakeJobServer::new());
        server.fail_register(true);
        let (mut hb, _) = heartbeat(&server, 3);

        for _ in 0..3 {
            hb.tick().await.unwrap();
        }
        assert_eq!(
            hb.tick().await,
            Err(HeartbeatError::TooManyFailures { failures: 4, max: 3 })
        );
    }

    #[tokio::test]
    async fn test_success_after_max_failures_resets_counter() {
        let server = Arc::new(FakeJobServer::new());
        let (mut hb, _) = heartbeat(&server, 3);
        hb.tick().await.unwrap();

        server.fail_refresh(true);
        server.fail_register(true);
        for _ in 0..3 {
            hb.tick().await.unwrap();
        }
        assert_eq!(hb.consecutive_failures(), 3);

        server.fail_refresh(false);
        server.fail_register(false);
        hb.tick().await.unwrap();
        assert_eq!(hb.consecutive_failures(), 0);

        server.fail_refresh(true);
        hb.tick().await.unwrap();
        assert_eq!(hb.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_after_registration_counts_once() {
        let server = Arc::new(FakeJobServer::new());
        server.fail_refresh(true);
        let (mut hb, identity) = heartbeat(&server, 3);

        hb.tick().await.unwrap();

        assert_eq!(server.refresh_count(), 1);
        assert!(!identity.is_registered());
        assert_eq!(hb.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_sustained_failure() {
        let server = Arc::new(FakeJobServer::new());
        server.fail_register(true);
        let (hb, _) = heartbeat(&server, 2);
        let (_tx, rx) = watch::channel(false);

        let result = hb.run(rx).await;

        assert_eq!(
            result,
            Err(HeartbeatError::TooManyFailures { failures: 3, max: 2 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let server = Arc::new(FakeJobServer::new());
        let (hb, _) = heartbeat(&server, 2);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(hb.run(rx));
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), Ok(()));
        assert!(server.refresh_count() >= 2);
    }
}
