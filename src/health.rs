//! Periodic per-bot and per-service health observation.
//!
//! A ticker polls the bot's own liveness and every connected service's
//! [`Pinger`], producing a [`HealthSnapshot`] broadcast to subscribers. The
//! ticker only runs while at least one subscriber is attached: it starts on
//! the first [`HealthObserver::subscribe`] and stops when the last
//! [`HealthSubscription`] is dropped.
//!
//! The actual HTTP/WebSocket round trip a `Pinger` performs is an external
//! collaborator; this module only owns the trait boundary, the refcounting,
//! and the broadcast/auto-switch wiring. [`HttpPinger`] is the one
//! first-party implementation, grounded in the `reqwest` usage already
//! present elsewhere in the crate.

use crate::prelude::*;

use crate::contracts::service::ServiceRegistry;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Performs the actual health-probe round trip for a connected service.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Returns whether the backing service currently responds healthily.
    async fn ping(&self) -> bool;
}

/// A minimal HTTP pinger: healthy iff a `GET` to `url` returns a 2xx status
/// within the default `reqwest` client timeout.
pub struct HttpPinger {
    url: String,
    client: reqwest::Client,
}

impl HttpPinger {
    /// Builds a pinger for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Pinger for HttpPinger {
    async fn ping(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("pinger request to {} failed: {e}", self.url);
                false
            }
        }
    }
}

/// Health of a single connected service.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    /// Service name.
    pub name: String,
    /// Whether its pinger reported healthy on the last tick.
    pub healthy: bool,
}

/// A snapshot of bot and per-service health, broadcast to subscribers on
/// every tick.
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    /// Whether the bot's own process/presence is healthy.
    pub bot_health: bool,
    /// Health of each service that has a pinger registered.
    pub per_service_health: Vec<ServiceHealth>,
    /// Whether the observer ticker is currently running.
    pub running: bool,
}

struct ObserverState {
    subscriber_count: usize,
    ticker_task: Option<JoinHandle<()>>,
}

/// Owns the ticker and subscriber refcount for one bot instance.
pub struct HealthObserver {
    interval: Duration,
    auto_switch: bool,
    registry: Arc<ServiceRegistry>,
    tx: watch::Sender<HealthSnapshot>,
    state: Mutex<ObserverState>,
}

impl HealthObserver {
    /// Builds an observer polling every `interval`. When `auto_switch` is
    /// set, each service's online flag follows its last ping outcome.
    #[must_use]
    pub fn new(interval: Duration, auto_switch: bool, registry: Arc<ServiceRegistry>) -> Arc<Self> {
        let (tx, _rx) = watch::channel(HealthSnapshot::default());
        Arc::new(Self {
            interval,
            auto_switch,
            registry,
            tx,
            state: Mutex::new(ObserverState {
                subscriber_count: 0,
                ticker_task: None,
            }),
        })
    }

    /// Subscribes to health snapshots, starting the ticker if this is the
    /// first subscriber.
    pub fn subscribe(self: &Arc<Self>) -> HealthSubscription {
        let mut state = self.state.lock().unwrap();
        state.subscriber_count += 1;

        if state.ticker_task.is_none() {
            let observer = Arc::clone(self);
            state.ticker_task = Some(tokio::spawn(async move {
                observer.run_ticker().await;
            }));
            info!("health observer started");
        }

        HealthSubscription {
            observer: Arc::clone(self),
            rx: self.tx.subscribe(),
        }
    }

    fn unsubscribe(&self) {
        let mut state = self.state.lock().unwrap();
        state.subscriber_count = state.subscriber_count.saturating_sub(1);
        if state.subscriber_count == 0 {
            if let Some(task) = state.ticker_task.take() {
                task.abort();
            }
            info!("health observer stopped, no subscribers remaining");
        }
    }

    async fn run_ticker(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;

            let mut per_service = Vec::new();
            for service in self.registry.all() {
                let healthy = match service.pinger() {
                    Some(pinger) => pinger.ping().await,
                    None => true,
                };
                if self.auto_switch {
                    service.set_online(healthy);
                }
                per_service.push(ServiceHealth {
                    name: service.name().to_owned(),
                    healthy,
                });
            }

            let snapshot = HealthSnapshot {
                bot_health: true,
                per_service_health: per_service,
                running: true,
            };

            if self.tx.send(snapshot).is_err() {
                trace!("health snapshot send had no receivers");
            }
        }
    }
}

/// A live subscription to [`HealthObserver`] updates. Dropping it
/// decrements the observer's refcount and, if it was the last one, stops
/// the ticker.
pub struct HealthSubscription {
    observer: Arc<HealthObserver>,
    rx: watch::Receiver<HealthSnapshot>,
}

impl HealthSubscription {
    /// Waits for the next snapshot.
    pub async fn next(&mut self) -> HealthSnapshot {
        let _ = self.rx.changed().await;
        self.rx.borrow_and_update().clone()
    }
}

impl Drop for HealthSubscription {
    fn drop(&mut self) {
        self.observer.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysHealthy;

    #[async_trait]
    impl Pinger for AlwaysHealthy {
        async fn ping(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn ticker_starts_on_first_subscribe_and_stops_on_last_drop() {
        let registry = Arc::new(ServiceRegistry::new());
        let observer = HealthObserver::new(Duration::from_millis(10), false, registry);

        let sub1 = observer.subscribe();
        assert_eq!(observer.state.lock().unwrap().subscriber_count, 1);
        let sub2 = observer.subscribe();
        assert_eq!(observer.state.lock().unwrap().subscriber_count, 2);

        drop(sub1);
        assert_eq!(observer.state.lock().unwrap().subscriber_count, 1);
        assert!(observer.state.lock().unwrap().ticker_task.is_some());

        drop(sub2);
        assert_eq!(observer.state.lock().unwrap().subscriber_count, 0);
        assert!(observer.state.lock().unwrap().ticker_task.is_none());
    }
}
