use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::Packet;

pub type ConnectionId = Uuid;

/// Handle to one client's transport channel.
///
/// Owns no delivery state: it carries the outbound packet channel, the
/// client identifier bound at CONNECT, and the advisory writability gate.
/// While the transport reports not-writable, outbound packets park in a
/// backlog that is drained on the next writable notification. The error and
/// close flags are signals to the transport task, which owns the actual
/// socket teardown.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    sender: UnboundedSender<Packet>,
    client_id: Mutex<Option<String>>,
    writable: AtomicBool,
    failed: AtomicBool,
    close_requested: AtomicBool,
    close_notify: Notify,
    backlog: Mutex<VecDeque<Packet>>,
    next_message_id: AtomicU16,
}

impl Connection {
    pub fn new(sender: UnboundedSender<Packet>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            client_id: Mutex::new(None),
            writable: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            close_notify: Notify::new(),
            backlog: Mutex::new(VecDeque::new()),
            next_message_id: AtomicU16::new(1),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Client identifier bound at CONNECT, absent before then.
    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().unwrap().clone()
    }

    pub fn bind_client(&self, client_id: &str) {
        *self.client_id.lock().unwrap() = Some(client_id.to_string());
    }

    pub fn unbind_client(&self) {
        *self.client_id.lock().unwrap() = None;
    }

    /// Queue-or-send, respecting the writability gate. A send on a closed
    /// channel is logged and dropped; the transport will report the loss.
    pub fn send(&self, packet: Packet) {
        if self.close_requested.load(Ordering::SeqCst) {
            return;
        }
        if !self.writable.load(Ordering::SeqCst) {
            self.backlog.lock().unwrap().push_back(packet);
            return;
        }
        if self.sender.send(packet).is_err() {
            debug!(conn = %self.id, "outbound channel closed, packet dropped");
        }
    }

    /// Update the writability gate. Returns true only on a not-writable to
    /// writable transition, so repeated notifications stay idempotent.
    pub fn set_writable(&self, writable: bool) -> bool {
        let was = self.writable.swap(writable, Ordering::SeqCst);
        writable && !was
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    /// Flush parked packets to the transport. Safe to call with an empty
    /// backlog.
    pub fn drain_backlog(&self) {
        let parked: Vec<Packet> = self.backlog.lock().unwrap().drain(..).collect();
        for packet in parked {
            if self.sender.send(packet).is_err() {
                break;
            }
        }
    }

    /// Allocate a message id for an outbound QoS > 0 delivery. Zero is not a
    /// valid MQTT message id and is skipped on wrap-around.
    pub fn next_message_id(&self) -> u16 {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Error signal raised at the dispatch boundary. Closing in response is
    /// the transport's decision.
    pub fn signal_error(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Ask the transport to tear the channel down.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    /// Resolves once a close has been requested.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        if self.close_requested.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}
