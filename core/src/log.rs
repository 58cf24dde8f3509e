//! Protocol diagnostics routed to whoever shows the "details" view.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[cfg(feature = "tracing")]
use tracing::debug;

/// A cloneable handle that components write their diagnostic lines into.
///
/// Lines are dropped silently once the receiving side is gone.
#[derive(Clone, Debug)]
pub struct LogSink {
    tx: Option<UnboundedSender<String>>,
}

impl LogSink {
    /// Creates a sink and the receiver draining it in order.
    pub fn channel() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();

        (Self { tx: Some(tx) }, rx)
    }

    /// A sink discarding everything but the tracing output.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn line(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("{}", line);

        if let Some(tx) = &self.tx {
            let _ = tx.send(line);
        }
    }
}
