//! Lifecycle signals emitted by the host application.
//!
//! Bound queries listen to these to refetch when the app regains focus or
//! comes back online. The host owns the detection (terminal focus events,
//! connectivity checks, ...) and calls [`Signals::emit`].
//!
//! ```
//! use revalidate::signal::{Signals, SystemSignal};
//!
//! let signals = Signals::new();
//! let mut rx = signals.subscribe();
//!
//! signals.emit(SystemSignal::Online);
//! assert_eq!(rx.try_recv().ok(), Some(SystemSignal::Online));
//! ```

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// A global signal that may warrant refetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemSignal {
    /// The application became visible or focused again.
    Focus,
    /// Network connectivity was restored.
    Online,
}

/// Broadcast hub for [`SystemSignal`]s.
///
/// Cloning yields another handle to the same channel.
#[derive(Debug, Clone)]
pub struct Signals {
    sender: broadcast::Sender<SystemSignal>,
}

impl Signals {
    /// Creates a hub buffering up to `capacity` undelivered signals per receiver.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a hub with the default capacity (16).
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    /// Emits a signal to every listener and returns how many received it.
    ///
    /// Emitting with no listeners is not an error; it simply reaches nobody.
    pub fn emit(&self, signal: SystemSignal) -> usize {
        let delivered = self.sender.send(signal).unwrap_or(0);
        tracing::trace!(?signal, delivered, "system signal emitted");
        delivered
    }

    /// Subscribes to future signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SystemSignal> {
        self.sender.subscribe()
    }

    /// Subscribes to future signals as a stream, skipping lagged gaps.
    pub fn stream(&self) -> BoxStream<'static, SystemSignal> {
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(|result| async move { result.ok() })
            .boxed()
    }

    /// Returns the number of active listeners.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}
