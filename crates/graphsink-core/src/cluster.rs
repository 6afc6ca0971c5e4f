//! Cluster topology seam and leader gating.
//!
//! The sink must only consume on the instance that can write the graph.
//! Topology is behind a trait so the standalone binary can hard-code a
//! single instance while embedders plug in their own membership view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// What the process knows about its own role.
pub trait ClusterView: Send + Sync {
    /// `true` when the process is not part of a cluster at all.
    fn is_single_instance(&self) -> bool;

    /// `true` when this instance holds leadership for `database`.
    fn is_leader(&self, database: &str) -> bool;

    /// `true` when `database` is up and writeable on this instance.
    fn is_available(&self, database: &str) -> bool;
}

/// The standalone topology: always leader, always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleInstance;

impl ClusterView for SingleInstance {
    fn is_single_instance(&self) -> bool {
        true
    }

    fn is_leader(&self, _database: &str) -> bool {
        true
    }

    fn is_available(&self, _database: &str) -> bool {
        true
    }
}

/// Mutable topology for tests and demos.
#[derive(Debug, Default)]
pub struct StaticClusterView {
    clustered: bool,
    leader: AtomicBool,
    available: AtomicBool,
}

impl StaticClusterView {
    /// A clustered view with the given initial role.
    #[must_use]
    pub fn clustered(leader: bool, available: bool) -> Self {
        Self {
            clustered: true,
            leader: AtomicBool::new(leader),
            available: AtomicBool::new(available),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl ClusterView for StaticClusterView {
    fn is_single_instance(&self) -> bool {
        !self.clustered
    }

    fn is_leader(&self, _database: &str) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn is_available(&self, _database: &str) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// Why the gate rejected a start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// This instance may run the sink.
    Eligible,
    /// Another instance holds leadership.
    NotLeader,
    /// The configuration demands a cluster and there is none.
    ClusterOnlyViolation,
}

impl Eligibility {
    #[must_use]
    pub fn is_eligible(self) -> bool {
        self == Self::Eligible
    }
}

/// Decides whether this instance may consume, and waits for readiness.
#[derive(Clone)]
pub struct LeaderGate {
    view: Arc<dyn ClusterView>,
}

impl LeaderGate {
    #[must_use]
    pub fn new(view: Arc<dyn ClusterView>) -> Self {
        Self { view }
    }

    /// Role check for `database` under the given `cluster_only` setting.
    ///
    /// With `cluster_only` set, a standalone instance is rejected outright:
    /// the operator asked for clustered semantics this process cannot
    /// provide, and consuming anyway would duplicate work once the real
    /// cluster comes up.
    #[must_use]
    pub fn eligibility(&self, database: &str, cluster_only: bool) -> Eligibility {
        if self.view.is_single_instance() {
            if cluster_only {
                return Eligibility::ClusterOnlyViolation;
            }
            return Eligibility::Eligible;
        }
        if self.view.is_leader(database) {
            Eligibility::Eligible
        } else {
            Eligibility::NotLeader
        }
    }

    /// `true` when `database` can be written from this instance right now.
    /// This is the gate the procedures use.
    #[must_use]
    pub fn is_writeable(&self, database: &str) -> bool {
        if self.view.is_single_instance() {
            return true;
        }
        self.view.is_leader(database) && self.view.is_available(database)
    }

    /// Polls until `database` reports available, up to `timeout`.
    ///
    /// Returns `false` on timeout; the caller decides whether that is
    /// fatal.
    pub async fn wait_until_available(
        &self,
        database: &str,
        timeout: Duration,
        check_interval: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.view.is_available(database) {
                return true;
            }
            if Instant::now() >= deadline {
                debug!(database, "availability wait timed out");
                return false;
            }
            tokio::time::sleep(check_interval).await;
        }
    }
}
