//! Fan-out of chat messages and roster updates.
//!
//! Every delivery works from a registry snapshot, so slow sockets never hold
//! the registry lock. A recipient whose write fails or times out is closed;
//! its own worker then runs the normal disconnect path. A frame over a
//! recipient's outbound limit is skipped for that recipient only.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, warn};

use crate::{
    error::FrameError,
    registry::Registry,
    session::{Session, SessionId},
};

pub const ROSTER_PREFIX: &str = "USERLIST:";

pub struct Broadcaster {
    registry: Arc<Registry>,
    write_timeout: Duration,
    // Serializes roster pushes so clients never see an older roster arrive
    // after a newer one.
    roster_lock: Mutex<()>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
            roster_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Relays `text` from `sender` to every other active session as
    /// `"<username>: <text>"`. Returns the number of successful deliveries.
    pub async fn send_to_others(&self, sender: SessionId, text: &str) -> usize {
        let sessions = self.registry.snapshot().await;
        let Some(username) = sessions
            .iter()
            .find(|session| session.id() == sender)
            .and_then(|session| session.username())
        else {
            debug!(session = %sender, "sender is no longer registered; dropping message");
            return 0;
        };

        let message = format_chat(username, text);
        let recipients = sessions
            .iter()
            .filter(|session| session.id() != sender && session.is_active());
        self.deliver_all(recipients, &message).await
    }

    /// Pushes the current roster to every active session, the newest arrival
    /// included. Returns the number of successful deliveries.
    pub async fn publish_roster(&self) -> usize {
        let _guard = self.roster_lock.lock().await;
        let active: Vec<_> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|session| session.is_active())
            .collect();

        let roster = format_roster(active.iter().filter_map(|session| session.username()));
        self.deliver_all(&active, &roster).await
    }

    async fn deliver_all<'a, I>(&self, recipients: I, message: &str) -> usize
    where
        I: IntoIterator<Item = &'a Arc<Session>>,
    {
        let deliveries = recipients
            .into_iter()
            .map(|session| self.deliver(session, message));
        join_all(deliveries)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    async fn deliver(&self, session: &Session, message: &str) -> bool {
        match timeout(self.write_timeout, session.send(message)).await {
            Ok(Ok(())) => true,
            // Nothing was written, so the connection is still in sync.
            Ok(Err(err @ FrameError::FrameTooLarge { .. })) => {
                warn!(session = %session.id(), error = %err, "dropping oversized frame for recipient");
                false
            }
            Ok(Err(err)) => {
                debug!(session = %session.id(), error = %err, "delivery failed; closing session");
                session.close();
                false
            }
            Err(_) => {
                debug!(session = %session.id(), timeout = ?self.write_timeout, "delivery timed out; closing session");
                session.close();
                false
            }
        }
    }
}

pub fn format_chat(username: &str, text: &str) -> String {
    format!("{username}: {text}")
}

pub fn format_roster<'a, I>(usernames: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let names: Vec<&str> = usernames.into_iter().collect();
    format!("{ROSTER_PREFIX}{}", names.join(","))
}

/// Splits a roster frame into usernames. `None` for any other frame.
pub fn parse_roster(frame: &str) -> Option<Vec<&str>> {
    frame
        .strip_prefix(ROSTER_PREFIX)
        .map(|names| names.split(',').collect())
}
