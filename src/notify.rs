use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered wake signals per subscriber; slow receivers lag, they never block.
const CHANNEL_CAPACITY: usize = 16;

/// Wake signal delivered to subscribers of a job name.
#[derive(Debug, Clone)]
pub struct Wakeup {
    /// Name of the queue that received work.
    pub name: String,
}

/// Low-latency wake channel layered over `LISTEN`/`NOTIFY`.
///
/// Every successful insert and requeue publishes the job name on one Postgres
/// channel; a listener task fans the payloads out to in-process broadcast
/// subscribers keyed by name. Strictly a latency optimization: the listener
/// reconnects on connection loss and notifications sent meanwhile are dropped,
/// which is fine because workers keep polling regardless.
pub(crate) struct Notifier {
    channel: String,
    senders: Mutex<HashMap<String, broadcast::Sender<Wakeup>>>,
}

impl Notifier {
    pub(crate) fn new(schema: &str) -> Self {
        Self {
            channel: format!("{schema}_wake"),
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to wake signals for one job name.
    pub(crate) fn subscribe(&self, name: &str) -> broadcast::Receiver<Wakeup> {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders
            .entry(name.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a wake signal for `name` through the store. Best effort: a
    /// failure here costs latency, not correctness.
    pub(crate) async fn publish(&self, pool: &PgPool, name: &str) {
        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(name)
            .execute(pool)
            .await;
        if let Err(error) = result {
            warn!(%error, job.name = %name, "Failed to publish wake signal");
        }
    }

    /// Hand a received payload to the in-process subscribers.
    fn dispatch(&self, name: &str) {
        let senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = senders.get(name) {
            // an error only means nobody is listening right now
            let _ = sender.send(Wakeup {
                name: name.to_owned(),
            });
        }
    }

    /// Run the listener until shutdown, reconnecting as needed.
    pub(crate) async fn listen(&self, pool: PgPool, shutdown: CancellationToken) {
        loop {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(error) => {
                    warn!(%error, "Wake listener failed to connect; retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };
            if let Err(error) = listener.listen(&self.channel).await {
                warn!(%error, channel = %self.channel, "Wake listener failed to subscribe");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
            debug!(channel = %self.channel, "Wake listener connected");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = listener.recv() => match received {
                        Ok(notification) => self.dispatch(notification.payload()),
                        Err(error) => {
                            warn!(%error, "Wake listener lost its connection");
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[tokio::test]
    async fn dispatch_reaches_subscribers_of_the_same_name() {
        let notifier = Notifier::new("overseer");
        let mut email = notifier.subscribe("email");
        let mut billing = notifier.subscribe("billing");

        notifier.dispatch("email");

        let wakeup = assert_ok!(email.try_recv());
        assert_eq!(wakeup.name, "email");
        assert_err!(billing.try_recv());
    }

    #[tokio::test]
    async fn dispatch_without_subscribers_is_a_no_op() {
        let notifier = Notifier::new("overseer");
        notifier.dispatch("nobody-listens");
    }
}
