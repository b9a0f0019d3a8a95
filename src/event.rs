//! Events handed from the network side to the user thread.
//!
//! The queue is single-producer / single-consumer: the context's receive loop (and
//!  the connection paths it drives) enqueue, the application thread drains via
//!  `poll_events`. FIFO order between events of one connection is preserved
//!  because all of them are produced by the same task.

use crate::connection::Connection;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

pub enum Event {
    /// The handshake completed and the connection is ESTABLISHED.
    Connected { conn: Arc<Connection> },
    /// The connection ended. `error` is set only for fatal I/O failures, never for
    ///  graceful or protocol-level disconnects. Emitted at most once per connection.
    Disconnected {
        conn: Arc<Connection>,
        error: Option<std::io::Error>,
    },
    /// A complete message arrived on a channel.
    Received {
        conn: Arc<Connection>,
        channel_id: u8,
        payload: Vec<u8>,
    },
}

/// Dispatch target for [`Event`]s, implemented by the application.
pub trait EventHandler {
    fn on_connect(&mut self, conn: &Arc<Connection>);

    fn on_disconnect(&mut self, conn: &Arc<Connection>, error: Option<&std::io::Error>);

    fn on_receive(&mut self, conn: &Arc<Connection>, channel_id: u8, payload: &[u8]);
}

pub struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        EventQueue {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, event: Event) {
        if self.tx.send(event).is_err() {
            warn!("event queue consumer is gone - dropping event");
        }
    }

    /// Drains all currently queued events into the handler. Returns the number of
    ///  events dispatched. Intended to be called from a single consumer thread.
    pub fn poll(&self, handler: &mut dyn EventHandler) -> usize {
        let mut rx = self.rx.lock().expect("event queue consumer lock poisoned");

        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            count += 1;
            match event {
                Event::Connected { conn } => handler.on_connect(&conn),
                Event::Disconnected { conn, error } => handler.on_disconnect(&conn, error.as_ref()),
                Event::Received {
                    conn,
                    channel_id,
                    payload,
                } => handler.on_receive(&conn, channel_id, &payload),
            }
        }
        count
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
