//! Typed session event subscriptions.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::SessionHandle;
use crate::models::event::{SessionEvent, SessionEventKind};

/// Pull-based stream of events for one session.
#[derive(Debug)]
pub struct Subscription {
    session: SessionHandle,
    rx: broadcast::Receiver<SessionEvent>,
}

impl Subscription {
    pub(crate) fn new(session: SessionHandle, rx: broadcast::Receiver<SessionEvent>) -> Self {
        Self { session, rx }
    }

    /// Session this subscription listens to.
    #[must_use]
    pub fn session(&self) -> SessionHandle {
        self.session
    }

    /// Wait for the next event. Returns `None` once the engine stops
    /// publishing for this session.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session = %self.session, skipped, "subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Background delivery task registered with [`Session::on`](crate::session::Session::on).
///
/// Delivery stops when [`unsubscribe`](Self::unsubscribe) is called or the
/// event stream ends. Dropping the handle leaves delivery running.
#[derive(Debug)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub(crate) fn spawn<F>(
        mut subscription: Subscription,
        filter: SessionEventKind,
        mut handler: F,
    ) -> Self
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => {
                        debug!(session = %subscription.session(), "event delivery unsubscribed");
                        break;
                    }
                    event = subscription.recv() => {
                        let Some(event) = event else {
                            debug!(session = %subscription.session(), "event stream closed");
                            break;
                        };
                        if event.kind() == filter {
                            handler(event);
                        }
                    }
                }
            }
        });
        Self { cancel, task }
    }

    /// Stop delivering events.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// Whether the delivery task is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop delivering and wait for the task to exit.
    pub async fn join(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "event delivery task failed");
        }
    }
}
