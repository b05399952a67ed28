//! In-process message bus
//!
//! Per-recipient FIFO queues keyed by agent id, created lazily on first
//! send, subscribe or receive. Receivers block on a shared "message
//! available" condition variable. Subscription handlers run synchronously
//! inside `send`, after the message is queued and outside the queue lock.

pub mod message;

pub use message::{AgentMessage, DeliveryStatus, MessagePriority, MessageType};

use crate::utils::{lock_mutex_recover, wait_recover, wait_timeout_recover};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest single wait inside `request` before re-checking the inbox
pub const DEFAULT_REQUEST_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handlers get a borrowed message and must not keep it
pub type MessageHandler = Arc<dyn Fn(&AgentMessage) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Message bus is shut down")]
    Shutdown,

    #[error("Timed out waiting for a message")]
    TimedOut,
}

/// Delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub sent: u64,
    pub broadcasts: u64,
    pub received: u64,
    pub handler_calls: u64,
}

struct Subscription {
    agent_id: String,
    filter: Option<MessageType>,
    handler: MessageHandler,
}

impl Subscription {
    fn matches(&self, message: &AgentMessage) -> bool {
        self.agent_id == message.receiver_id
            && self.filter.map_or(true, |t| t == message.message_type)
    }
}

#[derive(Default)]
struct BusInner {
    queues: HashMap<String, VecDeque<AgentMessage>>,
    shutdown: bool,
    stats: BusStats,
}

impl BusInner {
    fn queue(&mut self, agent_id: &str) -> &mut VecDeque<AgentMessage> {
        self.queues.entry(agent_id.to_string()).or_default()
    }

    fn pop(&mut self, agent_id: &str) -> Option<AgentMessage> {
        let message = self.queue(agent_id).pop_front();
        if message.is_some() {
            self.stats.received += 1;
        }
        message
    }
}

pub struct MessageBus {
    inner: Mutex<BusInner>,
    available: Condvar,
    subscriptions: Mutex<Vec<Subscription>>,
    poll_interval: Duration,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_REQUEST_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            available: Condvar::new(),
            subscriptions: Mutex::new(Vec::new()),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Create an (empty) inbox for an agent so it receives broadcasts
    pub fn register(&self, agent_id: &str) {
        lock_mutex_recover(&self.inner).queue(agent_id);
    }

    fn handlers_for(&self, message: &AgentMessage) -> Vec<MessageHandler> {
        lock_mutex_recover(&self.subscriptions)
            .iter()
            .filter(|s| s.matches(message))
            .map(|s| s.handler.clone())
            .collect()
    }

    fn run_handlers(&self, deliveries: Vec<(AgentMessage, Vec<MessageHandler>)>) {
        let mut calls = 0;
        for (message, handlers) in deliveries {
            for handler in handlers {
                handler(&message);
                calls += 1;
            }
        }
        if calls > 0 {
            lock_mutex_recover(&self.inner).stats.handler_calls += calls;
        }
    }

    /// Queue a message for its receiver. An empty receiver broadcasts.
    pub fn send(&self, mut message: AgentMessage) -> Result<(), BusError> {
        if message.is_broadcast() {
            return self.broadcast(message).map(|_| ());
        }

        let handlers = self.handlers_for(&message);
        let snapshot = {
            let mut inner = lock_mutex_recover(&self.inner);
            if inner.shutdown {
                message.mark_failed();
                return Err(BusError::Shutdown);
            }
            message.mark_delivered();
            log::debug!(
                "Message {} ({}) {} -> {}",
                message.id,
                message.message_type,
                message.sender_id,
                message.receiver_id
            );
            let snapshot = (!handlers.is_empty()).then(|| message.clone());
            let receiver = message.receiver_id.clone();
            inner.queue(&receiver).push_back(message);
            inner.stats.sent += 1;
            snapshot
        };
        self.available.notify_all();

        if let Some(snapshot) = snapshot {
            self.run_handlers(vec![(snapshot, handlers)]);
        }
        Ok(())
    }

    /// Deliver a copy to every known inbox except the sender's own.
    ///
    /// Returns the number of recipients.
    pub fn broadcast(&self, message: AgentMessage) -> Result<usize, BusError> {
        let mut deliveries = Vec::new();
        let count = {
            let mut inner = lock_mutex_recover(&self.inner);
            if inner.shutdown {
                return Err(BusError::Shutdown);
            }

            let targets: Vec<String> = inner
                .queues
                .keys()
                .filter(|id| **id != message.sender_id)
                .cloned()
                .collect();

            for target in &targets {
                let mut copy = message.clone();
                copy.receiver_id = target.clone();
                copy.mark_delivered();
                deliveries.push(copy.clone());
                inner.queue(target).push_back(copy);
            }
            inner.stats.broadcasts += 1;
            inner.stats.sent += targets.len() as u64;
            targets.len()
        };
        self.available.notify_all();

        log::debug!(
            "Broadcast {} from {} reached {} agent(s)",
            message.message_type,
            message.sender_id,
            count
        );

        let deliveries = deliveries
            .into_iter()
            .map(|m| {
                let handlers = self.handlers_for(&m);
                (m, handlers)
            })
            .filter(|(_, handlers)| !handlers.is_empty())
            .collect();
        self.run_handlers(deliveries);
        Ok(count)
    }

    /// Block until a message arrives for `agent_id`. `None` once shut down.
    pub fn receive(&self, agent_id: &str) -> Option<AgentMessage> {
        let mut inner = lock_mutex_recover(&self.inner);
        loop {
            if inner.shutdown {
                return None;
            }
            if let Some(message) = inner.pop(agent_id) {
                return Some(message);
            }
            inner = wait_recover(&self.available, inner);
        }
    }

    pub fn receive_with_timeout(
        &self,
        agent_id: &str,
        timeout_ms: u64,
    ) -> Result<AgentMessage, BusError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut inner = lock_mutex_recover(&self.inner);
        loop {
            if inner.shutdown {
                return Err(BusError::Shutdown);
            }
            if let Some(message) = inner.pop(agent_id) {
                return Ok(message);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BusError::TimedOut);
            }
            let (guard, _) = wait_timeout_recover(&self.available, inner, deadline - now);
            inner = guard;
        }
    }

    pub fn try_receive(&self, agent_id: &str) -> Option<AgentMessage> {
        let mut inner = lock_mutex_recover(&self.inner);
        if inner.shutdown {
            return None;
        }
        inner.pop(agent_id)
    }

    /// Send `message` and wait for the reply correlated to it.
    ///
    /// The reply is taken out of the sender's own inbox in place; other
    /// messages queued there keep their order.
    pub fn request(
        &self,
        mut message: AgentMessage,
        timeout_ms: u64,
    ) -> Result<AgentMessage, BusError> {
        message.expects_response = true;
        message.correlation_id = Some(message.id.clone());
        let request_id = message.id.clone();
        let sender = message.sender_id.clone();

        self.send(message)?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut inner = lock_mutex_recover(&self.inner);
        loop {
            if inner.shutdown {
                return Err(BusError::Shutdown);
            }

            let queue = inner.queue(&sender);
            let position = queue.iter().position(|m| {
                m.id != request_id && m.correlation_id.as_deref() == Some(request_id.as_str())
            });
            if let Some(response) = position.and_then(|pos| queue.remove(pos)) {
                inner.stats.received += 1;
                return Ok(response);
            }

            let now = Instant::now();
            if now >= deadline {
                log::debug!("Request {} from {} timed out", request_id, sender);
                return Err(BusError::TimedOut);
            }
            let wait = self.poll_interval.min(deadline - now);
            let (guard, _) = wait_timeout_recover(&self.available, inner, wait);
            inner = guard;
        }
    }

    /// Register or replace the handler for `(agent_id, filter)`.
    /// A `None` filter matches every message type.
    pub fn subscribe<F>(&self, agent_id: &str, filter: Option<MessageType>, handler: F)
    where
        F: Fn(&AgentMessage) + Send + Sync + 'static,
    {
        self.register(agent_id);

        let handler: MessageHandler = Arc::new(handler);
        let mut subscriptions = lock_mutex_recover(&self.subscriptions);
        match subscriptions
            .iter_mut()
            .find(|s| s.agent_id == agent_id && s.filter == filter)
        {
            Some(existing) => existing.handler = handler,
            None => subscriptions.push(Subscription {
                agent_id: agent_id.to_string(),
                filter,
                handler,
            }),
        }
    }

    /// Remove every subscription of an agent, returning how many were dropped
    pub fn unsubscribe(&self, agent_id: &str) -> usize {
        let mut subscriptions = lock_mutex_recover(&self.subscriptions);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.agent_id != agent_id);
        before - subscriptions.len()
    }

    /// Status-only acknowledgement; the sender is not notified
    pub fn acknowledge(&self, message: &mut AgentMessage) {
        message.acknowledge();
    }

    pub fn pending_count(&self, agent_id: &str) -> usize {
        lock_mutex_recover(&self.inner)
            .queues
            .get(agent_id)
            .map_or(0, |q| q.len())
    }

    /// Drop all pending messages for an agent
    pub fn clear(&self, agent_id: &str) -> usize {
        lock_mutex_recover(&self.inner)
            .queues
            .get_mut(agent_id)
            .map_or(0, |q| {
                let count = q.len();
                q.clear();
                count
            })
    }

    /// Forget an agent's inbox entirely
    pub fn remove_queue(&self, agent_id: &str) -> bool {
        lock_mutex_recover(&self.inner)
            .queues
            .remove(agent_id)
            .is_some()
    }

    pub fn queue_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_mutex_recover(&self.inner)
            .queues
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> BusStats {
        lock_mutex_recover(&self.inner).stats.clone()
    }

    /// One-way shutdown: wakes every blocked receiver
    pub fn shutdown(&self) {
        {
            let mut inner = lock_mutex_recover(&self.inner);
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
        }
        log::info!("Message bus shut down");
        self.available.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        lock_mutex_recover(&self.inner).shutdown
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn msg(sender: &str, receiver: &str, payload: &str) -> AgentMessage {
        AgentMessage::new(MessageType::Custom, sender, receiver).with_payload(payload)
    }

    #[test]
    fn test_send_receive_fifo() {
        let bus = MessageBus::new();
        bus.send(msg("a", "b", "one")).unwrap();
        bus.send(msg("a", "b", "two")).unwrap();
        assert_eq!(bus.pending_count("b"), 2);

        let first = bus.try_receive("b").unwrap();
        assert_eq!(first.payload, "one");
        assert_eq!(first.status, DeliveryStatus::Delivered);
        assert_eq!(bus.try_receive("b").unwrap().payload, "two");
        assert!(bus.try_receive("b").is_none());
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let bus = MessageBus::new();
        bus.register("a");
        bus.register("b");
        bus.register("c");

        let count = bus.broadcast(msg("a", "", "hello")).unwrap();
        assert_eq!(count, 2);
        assert_eq!(bus.pending_count("a"), 0);
        assert_eq!(bus.try_receive("b").unwrap().receiver_id, "b");
        assert_eq!(bus.try_receive("c").unwrap().payload, "hello");
    }

    #[test]
    fn test_send_with_empty_receiver_broadcasts() {
        let bus = MessageBus::new();
        bus.register("a");
        bus.register("b");
        bus.send(AgentMessage::status_update("a", "idle")).unwrap();
        assert_eq!(bus.pending_count("b"), 1);
        assert_eq!(bus.stats().broadcasts, 1);
    }

    #[test]
    fn test_subscription_filter() {
        let bus = MessageBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        bus.subscribe("b", Some(MessageType::Heartbeat), move |m| {
            assert_eq!(m.message_type, MessageType::Heartbeat);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.send(msg("a", "b", "ignored")).unwrap();
        bus.send(AgentMessage::new(MessageType::Heartbeat, "a", "b")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Handlers do not consume the message
        assert_eq!(bus.pending_count("b"), 2);

        assert_eq!(bus.unsubscribe("b"), 1);
        bus.send(AgentMessage::new(MessageType::Heartbeat, "a", "b")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_replaces_existing_handler() {
        let bus = MessageBus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        let s = second.clone();
        bus.subscribe("b", None, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe("b", None, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.send(msg("a", "b", "x")).unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_send() {
        let bus = Arc::new(MessageBus::new());
        let relay = bus.clone();
        bus.subscribe("b", Some(MessageType::Custom), move |m| {
            relay
                .send(AgentMessage::create_response(m, "ack"))
                .unwrap();
        });

        bus.send(msg("a", "b", "ping")).unwrap();
        let reply = bus.try_receive("a").unwrap();
        assert_eq!(reply.payload, "ack");
    }

    #[test]
    fn test_request_response_correlation() {
        let bus = Arc::new(MessageBus::new());
        let responder = {
            let bus = bus.clone();
            thread::spawn(move || {
                let request = bus.receive("server").unwrap();
                assert!(request.expects_response);
                assert_eq!(request.correlation_id.as_deref(), Some(request.id.as_str()));
                bus.send(AgentMessage::create_response(&request, "pong"))
                    .unwrap();
            })
        };

        // Noise already waiting in the client's inbox must survive the request
        bus.send(msg("other", "client", "unrelated")).unwrap();

        let request = AgentMessage::new(MessageType::TaskRequest, "client", "server")
            .with_payload("ping");
        let request_id = request.id.clone();
        let response = bus.request(request, 2_000).unwrap();
        responder.join().unwrap();

        assert_eq!(response.payload, "pong");
        assert_eq!(response.correlation_id, Some(request_id));
        assert_eq!(bus.try_receive("client").unwrap().payload, "unrelated");
    }

    #[test]
    fn test_request_times_out() {
        let bus = MessageBus::new();
        let request = AgentMessage::new(MessageType::TaskRequest, "client", "nobody");
        assert_eq!(bus.request(request, 30).unwrap_err(), BusError::TimedOut);
    }

    #[test]
    fn test_shutdown_wakes_receiver() {
        let bus = Arc::new(MessageBus::new());
        let waiter = {
            let bus = bus.clone();
            thread::spawn(move || bus.receive("idle-agent"))
        };
        thread::sleep(Duration::from_millis(30));
        bus.shutdown();
        assert!(waiter.join().unwrap().is_none());
        assert_eq!(bus.send(msg("a", "b", "late")).unwrap_err(), BusError::Shutdown);
    }

    #[test]
    fn test_receive_with_timeout() {
        let bus = MessageBus::new();
        assert_eq!(
            bus.receive_with_timeout("b", 20).unwrap_err(),
            BusError::TimedOut
        );
        bus.send(msg("a", "b", "now")).unwrap();
        assert_eq!(bus.receive_with_timeout("b", 20).unwrap().payload, "now");
    }

    #[test]
    fn test_clear_and_remove_queue() {
        let bus = MessageBus::new();
        bus.send(msg("a", "b", "1")).unwrap();
        bus.send(msg("a", "b", "2")).unwrap();
        assert_eq!(bus.clear("b"), 2);
        assert!(bus.remove_queue("b"));
        assert!(!bus.queue_ids().contains(&"b".to_string()));
    }
}
