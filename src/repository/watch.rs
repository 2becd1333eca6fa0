use super::PolicyEvent;
use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

/// Subscription to repository change events.
///
/// Ends when the token is cancelled or the repository is dropped. A subscriber that falls more
/// than the channel capacity behind skips the oldest events and logs how many were lost.
#[derive(Debug)]
pub struct PolicyWatch {
    receiver: broadcast::Receiver<PolicyEvent>,
    cancel: CancellationToken,
}

impl PolicyWatch {
    pub fn new(receiver: broadcast::Receiver<PolicyEvent>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// Next event, or `None` once the watch has ended.
    pub async fn recv(&mut self) -> Option<PolicyEvent> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                received = self.receiver.recv() => match received {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "resilience_policy::repository", skipped, "policy watch lagged");
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = PolicyEvent> + Send + 'static {
        futures::stream::unfold(self, |mut watch| async move {
            watch.recv().await.map(|event| (event, watch))
        })
    }
}
