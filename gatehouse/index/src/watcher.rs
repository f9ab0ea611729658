use crate::index::SharedIndex;
use futures::prelude::*;
use gatehouse_core::{registry::RegistryEvent, Error};
use rand::Rng;
use std::pin::Pin;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

pub type RegistryStream = Pin<Box<dyn Stream<Item = Result<RegistryEvent, Error>> + Send>>;

/// A source of registration events.
///
/// A stream yields [`Error::MalformedRegistrationEvent`] for an event it
/// could not decode and keeps going; any other error ends the stream.
#[async_trait::async_trait]
pub trait RegistryFeed: Send + Sync {
    async fn watch(&self) -> Result<RegistryStream, Error>;
}

/// Exponential backoff with jitter between reconnection attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

/// Keeps one namespace of the index in sync with a registry feed.
#[derive(Debug)]
pub struct Watcher<F> {
    namespace: String,
    feed: F,
    index: SharedIndex,
    backoff: Backoff,
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// The delay before reconnection attempt `failures` (starting at 1),
    /// jittered between half and one and a half times the nominal delay.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = self.multiplier.powi(failures.saturating_sub(1).min(32) as i32);
        let nominal = self.min.as_secs_f64() * exp;
        let nominal = nominal.min(self.max.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(nominal * jitter)
    }
}

// === impl Watcher ===

impl<F: RegistryFeed> Watcher<F> {
    pub fn new(namespace: impl Into<String>, feed: F, index: SharedIndex) -> Self {
        Self {
            namespace: namespace.into(),
            feed,
            index,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    /// Follows the feed until shutdown, reconnecting forever. Routes already
    /// published keep serving while the feed is unavailable.
    pub async fn run(self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        let mut failures = 0u32;
        loop {
            let error = tokio::select! {
                error = self.follow(&mut failures) => error,
                _ = &mut shutdown => return,
            };

            failures = failures.saturating_add(1);
            let delay = self.backoff.delay(failures);
            warn!(
                namespace = %self.namespace,
                %error,
                failures,
                delay_ms = delay.as_millis() as u64,
                "Registry feed lost; retrying"
            );

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = &mut shutdown => return,
            }
        }
    }

    /// Consumes one feed connection and returns the error that ended it.
    async fn follow(&self, failures: &mut u32) -> Error {
        let mut events = match self.feed.watch().await {
            Ok(events) => events,
            Err(error) => return error,
        };
        info!(namespace = %self.namespace, "Watching registry");

        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    *failures = 0;
                    self.handle(event);
                }
                Err(Error::MalformedRegistrationEvent(reason)) => {
                    warn!(namespace = %self.namespace, %reason, "Dropping malformed registration event");
                }
                Err(error) => return error,
            }
        }

        Error::TransportFailure("registry feed closed".to_string())
    }

    fn handle(&self, event: RegistryEvent) {
        match self.index.write().handle(&self.namespace, event) {
            Ok(published) => debug!(namespace = %self.namespace, published, "Applied registry event"),
            Err(error) => {
                warn!(namespace = %self.namespace, %error, "Dropping malformed registration event")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded() {
        let backoff = Backoff {
            min: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        for failures in 1..100 {
            let delay = backoff.delay(failures);
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(1500), "{delay:?}");
        }
        assert!(backoff.delay(1) <= Duration::from_millis(150));
    }
}
