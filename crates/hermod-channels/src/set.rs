//! Supervision of the installed transports.
//!
//! A [`TransportSet`] owns every platform driver the process runs. Bringing
//! links up walks the retry schedule per surface; a surface that never comes
//! up is logged and skipped, never fatal, and sessions are untouched either
//! way.

use std::collections::BTreeMap;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    error::TransportError,
    retry::RetryPolicy,
    transport::Transport,
    types::LinkHealth,
};

pub struct TransportSet {
    policy: RetryPolicy,
    /// Keyed by surface name; BTreeMap keeps reports in stable order.
    transports: BTreeMap<String, Box<dyn Transport + Send + Sync>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::link())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            policy,
            transports: BTreeMap::new(),
        }
    }

    /// Install a driver under its surface name, displacing any previous one.
    pub fn install(&mut self, transport: Box<dyn Transport + Send + Sync>) {
        let surface = transport.surface().to_string();
        if self.transports.insert(surface.clone(), transport).is_some() {
            warn!(%surface, "transport replaced an existing driver");
        } else {
            info!(%surface, "transport installed");
        }
    }

    /// Bring every installed link up, each through the retry schedule.
    /// Returns how many surfaces ended up live.
    pub async fn bring_up(&mut self) -> usize {
        let mut live = 0;
        for (surface, transport) in self.transports.iter_mut() {
            match establish(&self.policy, surface, transport.as_mut()).await {
                Ok(attempts) => {
                    live += 1;
                    info!(%surface, attempts, "link up");
                }
                Err(e) => {
                    error!(%surface, error = %e, "link never came up; surface disabled");
                }
            }
        }
        live
    }

    /// Best-effort teardown of every link.
    pub async fn bring_down(&mut self) {
        for (surface, transport) in self.transports.iter_mut() {
            if let Err(e) = transport.set_link(false).await {
                warn!(%surface, error = %e, "link teardown reported an error");
            }
        }
    }

    pub fn lookup(&self, surface: &str) -> Option<&(dyn Transport + Send + Sync)> {
        self.transports.get(surface).map(|t| t.as_ref())
    }

    /// `(surface, health)` for every installed transport, in name order.
    pub fn health_report(&self) -> Vec<(String, LinkHealth)> {
        self.transports
            .iter()
            .map(|(surface, t)| (surface.clone(), t.health()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl Default for TransportSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the retry schedule for one link. Returns the attempts spent on
/// success; the last error once the budget is gone or the failure is not
/// retryable.
async fn establish(
    policy: &RetryPolicy,
    surface: &str,
    transport: &mut dyn Transport,
) -> Result<u32, TransportError> {
    let mut attempts = 0u32;
    loop {
        match transport.set_link(true).await {
            Ok(()) => return Ok(attempts + 1),
            Err(e) => {
                attempts += 1;
                if policy.exhausted(attempts) || !e.is_retryable() {
                    return Err(e);
                }
                let delay = policy.delay_for(surface, attempts - 1);
                warn!(
                    %surface,
                    attempts,
                    budget = policy.budget,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "link attempt failed"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutboundMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct FlakyTransport {
        surface: String,
        fail_times: u32,
        refuse: bool,
        attempts: Arc<AtomicU32>,
        up: AtomicBool,
    }

    impl FlakyTransport {
        fn boxed(surface: &str, fail_times: u32) -> Box<Self> {
            Box::new(Self {
                surface: surface.to_string(),
                fail_times,
                refuse: false,
                attempts: Arc::new(AtomicU32::new(0)),
                up: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        fn surface(&self) -> &str {
            &self.surface
        }

        async fn set_link(&mut self, up: bool) -> Result<(), TransportError> {
            if !up {
                self.up.store(false, Ordering::SeqCst);
                return Ok(());
            }
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_times {
                if self.refuse {
                    return Err(TransportError::Refused {
                        surface: self.surface.clone(),
                        reason: "bad token".into(),
                    });
                }
                return Err(TransportError::Transient {
                    surface: self.surface.clone(),
                    reason: "flap".into(),
                });
            }
            self.up.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn push(&self, _msg: &OutboundMessage) -> Result<(), TransportError> {
            Ok(())
        }

        fn health(&self) -> LinkHealth {
            if self.up.load(Ordering::SeqCst) {
                LinkHealth::Up
            } else {
                LinkHealth::Down
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(10),
            cap: Duration::from_millis(40),
            budget: 5,
            jitter_permille: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn link_comes_up_after_transient_failures() {
        let transport = FlakyTransport::boxed("telegram", 3);
        let attempts = Arc::clone(&transport.attempts);
        let mut set = TransportSet::with_policy(fast_policy());
        set.install(transport);

        assert_eq!(set.bring_up().await, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(
            set.health_report(),
            vec![("telegram".to_string(), LinkHealth::Up)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refusal_stops_the_schedule_immediately() {
        let mut transport = FlakyTransport::boxed("discord", u32::MAX);
        transport.refuse = true;
        let attempts = Arc::clone(&transport.attempts);
        let mut set = TransportSet::with_policy(fast_policy());
        set.install(transport);

        assert_eq!(set.bring_up().await, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "refusals must not retry");
    }

    #[tokio::test(start_paused = true)]
    async fn budget_bounds_the_attempts() {
        let transport = FlakyTransport::boxed("webchat", u32::MAX);
        let attempts = Arc::clone(&transport.attempts);
        let mut set = TransportSet::with_policy(fast_policy());
        set.install(transport);

        assert_eq!(set.bring_up().await, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn install_displaces_same_surface() {
        let mut set = TransportSet::with_policy(fast_policy());
        set.install(FlakyTransport::boxed("webchat", 0));
        set.install(FlakyTransport::boxed("webchat", 0));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn report_is_in_surface_order() {
        let mut set = TransportSet::with_policy(fast_policy());
        set.install(FlakyTransport::boxed("zeta", 0));
        set.install(FlakyTransport::boxed("alpha", 0));
        let names: Vec<String> = set.health_report().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn bring_down_lowers_every_link() {
        let mut set = TransportSet::with_policy(fast_policy());
        set.install(FlakyTransport::boxed("webchat", 0));
        set.bring_up().await;
        set.bring_down().await;
        assert_eq!(
            set.health_report(),
            vec![("webchat".to_string(), LinkHealth::Down)]
        );
    }
}
