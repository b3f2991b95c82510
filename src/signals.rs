use crate::Result;

use std::pin::Pin;

use futures::stream::{select_all, Stream, StreamExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::SignalStream;

/// Stream of shutdown requests (SIGINT, SIGTERM).
pub struct ShutdownSignals {
    stream: Pin<Box<dyn Stream<Item = ()> + Send>>,
}

impl ShutdownSignals {
    pub fn new() -> Result<Self> {
        let streams = [SignalKind::interrupt(), SignalKind::terminate()]
            .into_iter()
            .map(|kind| signal(kind).map(SignalStream::new))
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(ShutdownSignals { stream: Box::pin(select_all(streams)) })
    }

    pub async fn next(&mut self) -> Option<()> {
        self.stream.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal};
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_is_delivered() {
        let mut signals = ShutdownSignals::new().unwrap();
        raise(Signal::SIGTERM).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), signals.next()).await;
        assert_eq!(received.unwrap(), Some(()));
    }
}
