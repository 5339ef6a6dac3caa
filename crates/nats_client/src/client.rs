//! NATS client wrapper with a bounded connect policy.

use anyhow::{anyhow, Result};
use async_nats::{Client, Subscriber};
use std::time::Duration;
use tracing::{info, warn};

/// Default number of connection attempts made at startup.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// Default delay before the second attempt (doubled after each failure).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for the backoff delay between attempts.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Build a `<domain>.<event>` subject.
pub fn subject(domain: &str, event: &str) -> String {
    format!("{}.{}", domain, event)
}

/// How hard to try reaching the server before giving up.
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay after the first failed attempt.
    pub retry_delay: Duration,
    /// Maximum delay for exponential backoff.
    pub max_retry_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl ConnectPolicy {
    /// Delays slept between consecutive attempts.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut delay = self.retry_delay;
        for _ in 1..self.attempts.max(1) {
            delays.push(delay);
            delay = (delay * 2).min(self.max_retry_delay);
        }
        delays
    }
}

/// Wrapper around the core NATS client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to a NATS server with a single attempt.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        Ok(Self { client })
    }

    /// Connect, retrying with exponential backoff until the policy is exhausted.
    pub async fn connect_with_policy(url: &str, policy: &ConnectPolicy) -> Result<Self> {
        let attempts = policy.attempts.max(1);
        let mut delays = policy.delays().into_iter();

        for attempt in 1..=attempts {
            match Self::connect(url).await {
                Ok(client) => {
                    info!("Connected to NATS on attempt {}/{}", attempt, attempts);
                    return Ok(client);
                }
                Err(e) => {
                    warn!(
                        "NATS connect attempt {}/{} to {} failed: {}",
                        attempt, attempts, url, e
                    );
                    if let Some(delay) = delays.next() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(anyhow!(
            "could not reach NATS at {} after {} attempts",
            url,
            attempts
        ))
    }

    /// Subscribe to a subject pattern using NATS Core push delivery.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        info!("Subscribing to subject pattern: {}", subject);
        let subscriber = self.client.subscribe(subject.to_string()).await?;
        Ok(subscriber)
    }

    /// Publish using NATS Core (fire-and-forget, no acknowledgement).
    pub async fn publish(&self, subject: &str, payload: bytes::Bytes) -> Result<()> {
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    /// Flush buffered publishes to the server.
    pub async fn flush(&self) -> Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_naming() {
        assert_eq!(subject("chat", "message"), "chat.message");
    }

    #[test]
    fn test_backoff_delays() {
        let policy = ConnectPolicy {
            attempts: 5,
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_millis(1500),
        };
        let delays = policy.delays();
        assert_eq!(delays.len(), 4);
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_millis(1000));
        assert_eq!(delays[2], Duration::from_millis(1500));
        assert_eq!(delays[3], Duration::from_millis(1500));
    }

    #[test]
    fn test_single_attempt_has_no_delay() {
        let policy = ConnectPolicy {
            attempts: 1,
            ..Default::default()
        };
        assert!(policy.delays().is_empty());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_policy() {
        let policy = ConnectPolicy {
            attempts: 2,
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(10),
        };
        // Port 1 is never a NATS server.
        let result = NatsClient::connect_with_policy("nats://127.0.0.1:1", &policy).await;
        assert!(result.is_err());
    }
}
