use std::sync::Arc;

use tokio::sync::mpsc;

/// Cheap, cloneable handle that forwards events into a session's inbound
/// channel. Library callbacks (peer connection, websocket pump) only ever see
/// this, never the channel's owner.
pub struct EventSink<E> {
    forward: Arc<dyn Fn(E) -> bool + Send + Sync>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            forward: Arc::clone(&self.forward),
        }
    }
}

impl<E: 'static> EventSink<E> {
    pub fn new(forward: impl Fn(E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            forward: Arc::new(forward),
        }
    }

    pub fn from_channel<T>(tx: mpsc::UnboundedSender<T>) -> Self
    where
        T: From<E> + Send + 'static,
    {
        Self::new(move |event| tx.send(T::from(event)).is_ok())
    }

    /// Returns `false` once the receiving side has gone away.
    pub fn emit(&self, event: E) -> bool {
        (self.forward)(event)
    }
}

impl<E> std::fmt::Debug for EventSink<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventSink")
    }
}
