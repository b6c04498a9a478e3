//! Message broker. Routes messages between agents and pairs requests with responses.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::{
    AgentDescriptor, AgentRegistry, Message, MessageKind, OrchestrationError, Response, Result,
};
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, warn};

/// Trait that every subscriber implements
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a message addressed to the subscribed agent.
    ///
    /// Returning `Some(response)` for a request settles the request's
    /// correlation id. Handlers that answer later call
    /// [`MessageBroker::respond`] themselves and return `None`.
    async fn handle(&self, message: Message) -> Option<Response>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Response>> + Send,
{
    async fn handle(&self, message: Message) -> Option<Response> {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a message handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

type HandlerTable = HashMap<String, Vec<(u64, Arc<dyn MessageHandler>)>>;

/// Handle returned by [`MessageBroker::subscribe`]
pub struct Subscription {
    agent_id: String,
    handler_id: u64,
    handlers: Arc<RwLock<HandlerTable>>,
}

impl Subscription {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Remove exactly the handler this subscription was created for
    pub async fn unsubscribe(self) {
        let mut handlers = self.handlers.write().await;
        if let Some(list) = handlers.get_mut(&self.agent_id) {
            list.retain(|(id, _)| *id != self.handler_id);
            if list.is_empty() {
                handlers.remove(&self.agent_id);
            }
        }
        debug!("Unsubscribed handler {} from '{}'", self.handler_id, self.agent_id);
    }
}

/// A requester waiting on one correlation id
struct PendingSlot {
    ticket: u64,
    tx: oneshot::Sender<Response>,
}

type PendingTable = Mutex<HashMap<String, PendingSlot>>;

fn lock(pending: &PendingTable) -> MutexGuard<'_, HashMap<String, PendingSlot>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a request's slot when the request returns or its future is
/// dropped. A slot opened later under the same id is left alone.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    correlation_id: String,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = lock(self.pending);
        if pending
            .get(&self.correlation_id)
            .is_some_and(|slot| slot.ticket == self.ticket)
        {
            pending.remove(&self.correlation_id);
        }
    }
}

/// Outcome of a fan-out broadcast
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, OrchestrationError)>,
}

/// Routes point-to-point messages to subscribed handlers and pairs
/// requests with their responses by correlation id.
///
/// Cloning is cheap; clones share the same tables.
#[derive(Clone)]
pub struct MessageBroker {
    registry: Arc<AgentRegistry>,
    handlers: Arc<RwLock<HandlerTable>>,
    /// correlation id -> waiting requester. Removing the entry is what
    /// settles a request, so only one of respond/timeout can win.
    pending: Arc<PendingTable>,
    next_handler_id: Arc<AtomicU64>,
    next_ticket: Arc<AtomicU64>,
}

impl MessageBroker {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_handler_id: Arc::new(AtomicU64::new(1)),
            next_ticket: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Register a handler for messages addressed to `agent_id`
    pub async fn subscribe(&self, agent_id: &str, handler: Arc<dyn MessageHandler>) -> Subscription {
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .write()
            .await
            .entry(agent_id.to_string())
            .or_default()
            .push((handler_id, handler));
        debug!("Subscribed handler {} to '{}'", handler_id, agent_id);

        Subscription {
            agent_id: agent_id.to_string(),
            handler_id,
            handlers: self.handlers.clone(),
        }
    }

    /// Deliver a message to every handler subscribed to its target and wait
    /// for all of them to finish. No response is awaited here.
    pub async fn send(&self, message: Message) -> Result<()> {
        let target = self
            .registry
            .get(&message.target)
            .await
            .ok_or_else(|| OrchestrationError::AgentNotFound(message.target.clone()))?;
        if !target.enabled {
            return Err(OrchestrationError::AgentDisabled(target.id));
        }

        // Snapshot so no lock is held while handlers run
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .read()
            .await
            .get(&message.target)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        debug!(
            "Routing {} message {} from '{}' to '{}' ({} handlers)",
            message.kind,
            message.id,
            message.source,
            message.target,
            handlers.len()
        );

        let replies = join_all(handlers.iter().map(|h| h.handle(message.clone()))).await;

        if message.kind == MessageKind::Request {
            let correlation_id = message.correlation_id();
            for response in replies.into_iter().flatten() {
                self.respond(correlation_id, response).await;
            }
        }
        Ok(())
    }

    /// Send a message and wait for the response correlated with it.
    ///
    /// Whichever of response and timeout happens first wins; the pending
    /// slot is removed on settlement so a later attempt is a no-op.
    /// Handlers run in a background task and may keep working after the
    /// response has been returned. A correlation id that is already
    /// awaiting a response is rejected with `DuplicateCorrelation`.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Response> {
        let correlation_id = message.correlation_id().to_string();
        let (slot, mut rx) = self.open_slot(&correlation_id)?;

        let mut delivery = tokio::spawn({
            let broker = self.clone();
            async move { broker.send(message).await }
        });

        let exchange = async {
            let received = tokio::select! {
                received = &mut rx => received,
                delivered = &mut delivery => {
                    match delivered {
                        Ok(Ok(())) => {}
                        // Routing failed, no handler will ever answer
                        Ok(Err(e)) => return Err(e),
                        Err(e) => warn!("Delivery of request {} aborted: {}", correlation_id, e),
                    }
                    // Handlers are done; a deferred respond may still arrive
                    (&mut rx).await
                }
            };
            // Sender dropped without a value only if the slot was removed unsettled
            received.map_err(|_| OrchestrationError::RequestTimeout {
                correlation_id: correlation_id.clone(),
                timeout,
            })
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                drop(slot);
                // A respond that slipped in before the slot was closed still counts
                if let Ok(response) = rx.try_recv() {
                    return Ok(response);
                }
                warn!("Request {} timed out after {:?}", correlation_id, timeout);
                Err(OrchestrationError::RequestTimeout {
                    correlation_id,
                    timeout,
                })
            }
        }
    }

    fn open_slot(
        &self,
        correlation_id: &str,
    ) -> Result<(PendingGuard<'_>, oneshot::Receiver<Response>)> {
        let mut pending = lock(&self.pending);
        if pending.contains_key(correlation_id) {
            return Err(OrchestrationError::DuplicateCorrelation(
                correlation_id.to_string(),
            ));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        pending.insert(correlation_id.to_string(), PendingSlot { ticket, tx });

        let guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.to_string(),
            ticket,
        };
        Ok((guard, rx))
    }

    /// Settle a pending request. Returns false if nothing was waiting
    /// (already settled, timed out, or never requested).
    pub async fn respond(&self, correlation_id: &str, response: Response) -> bool {
        let slot = lock(&self.pending).remove(correlation_id);
        let Some(slot) = slot else {
            debug!("Ignoring response for unknown or settled request {}", correlation_id);
            return false;
        };
        // The receiver may have been dropped by a timeout racing this call
        slot.tx.send(response).is_ok()
    }

    /// Send one message per enabled agent other than `source`, optionally
    /// narrowed by `filter`. Individual failures do not stop the others.
    pub async fn broadcast(
        &self,
        source: &str,
        kind: MessageKind,
        payload: Value,
        filter: Option<&(dyn Fn(&AgentDescriptor) -> bool + Send + Sync)>,
    ) -> BroadcastReport {
        let targets: Vec<AgentDescriptor> = self
            .registry
            .get_enabled()
            .await
            .into_iter()
            .filter(|agent| agent.id != source)
            .filter(|agent| filter.is_none_or(|f| f(agent)))
            .collect();

        let sends = targets.iter().map(|agent| {
            let message = Message::new(source, agent.id.clone(), kind, payload.clone());
            async move { (agent.id.clone(), self.send(message).await) }
        });

        let mut report = BroadcastReport::default();
        for (agent_id, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered.push(agent_id),
                Err(e) => {
                    warn!("Broadcast from '{}' to '{}' failed: {}", source, agent_id, e);
                    report.failed.push((agent_id, e));
                }
            }
        }
        report
    }

    /// Number of requests currently waiting for a response
    pub async fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub async fn subscriber_count(&self, agent_id: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(agent_id)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn broker_with(agents: &[&str]) -> MessageBroker {
        let registry = Arc::new(AgentRegistry::new());
        for id in agents {
            registry
                .register(AgentDescriptor::new(*id, "test", *id))
                .await
                .unwrap();
        }
        MessageBroker::new(registry)
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        handler_fn(move |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }
        })
    }

    fn echo_handler() -> Arc<dyn MessageHandler> {
        handler_fn(|msg: Message| async move { Some(Response::ok(msg.payload)) })
    }

    #[tokio::test]
    async fn test_send_unknown_agent() {
        let broker = broker_with(&[]).await;
        let msg = Message::new("a", "ghost", MessageKind::Event, Value::Null);
        let err = broker.send(msg).await.unwrap_err();
        assert_eq!(err, OrchestrationError::AgentNotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn test_send_disabled_agent() {
        let broker = broker_with(&["worker"]).await;
        broker.registry().set_enabled("worker", false).await;
        let msg = Message::new("a", "worker", MessageKind::Event, Value::Null);
        let err = broker.send(msg).await.unwrap_err();
        assert_eq!(err, OrchestrationError::AgentDisabled("worker".to_string()));
    }

    #[tokio::test]
    async fn test_send_invokes_all_handlers() {
        let broker = broker_with(&["worker"]).await;
        let counter = Arc::new(AtomicUsize::new(0));
        let _s1 = broker.subscribe("worker", counting_handler(counter.clone())).await;
        let _s2 = broker.subscribe("worker", counting_handler(counter.clone())).await;

        broker
            .send(Message::new("a", "worker", MessageKind::Event, Value::Null))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_send_waits_for_slow_handlers() {
        let broker = broker_with(&["worker"]).await;
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let _s = broker
            .subscribe(
                "worker",
                handler_fn(move |_msg| {
                    let c = c.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        c.fetch_add(1, Ordering::SeqCst);
                        None
                    }
                }),
            )
            .await;

        broker
            .send(Message::new("a", "worker", MessageKind::Event, Value::Null))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_that_handler() {
        let broker = broker_with(&["worker"]).await;
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let s1 = broker.subscribe("worker", counting_handler(first.clone())).await;
        let _s2 = broker.subscribe("worker", counting_handler(second.clone())).await;
        assert_eq!(broker.subscriber_count("worker").await, 2);

        s1.unsubscribe().await;
        assert_eq!(broker.subscriber_count("worker").await, 1);

        broker
            .send(Message::new("a", "worker", MessageKind::Event, Value::Null))
            .await
            .unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_response() {
        let broker = broker_with(&["echo"]).await;
        let _s = broker.subscribe("echo", echo_handler()).await;

        let msg = Message::new("a", "echo", MessageKind::Request, serde_json::json!({"x": 1}));
        let response = broker.request(msg, Duration::from_secs(1)).await.unwrap();
        assert!(response.success);
        assert_eq!(response.data.unwrap()["x"], 1);
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_deferred_respond() {
        let broker = broker_with(&["worker"]).await;
        let responder = broker.clone();
        let _s = broker
            .subscribe(
                "worker",
                handler_fn(move |msg: Message| {
                    let responder = responder.clone();
                    async move {
                        let correlation_id = msg.correlation_id().to_string();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            responder
                                .respond(&correlation_id, Response::ok(serde_json::json!("later")))
                                .await;
                        });
                        None
                    }
                }),
            )
            .await;

        let msg = Message::new("a", "worker", MessageKind::Request, Value::Null);
        let response = broker.request(msg, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.data, Some(serde_json::json!("later")));
    }

    #[tokio::test]
    async fn test_request_timeout_cleans_pending() {
        let broker = broker_with(&["silent"]).await;
        let msg = Message::new("a", "silent", MessageKind::Request, Value::Null);
        let id = msg.id.clone();

        let started = std::time::Instant::now();
        let err = broker.request(msg, Duration::from_millis(50)).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(
            err,
            OrchestrationError::RequestTimeout {
                correlation_id: id.clone(),
                timeout: Duration::from_millis(50),
            }
        );
        assert_eq!(broker.pending_count().await, 0);

        // A late response is a harmless no-op
        assert!(!broker.respond(&id, Response::ok_empty()).await);
    }

    #[tokio::test]
    async fn test_request_timeout_covers_slow_handler() {
        let broker = broker_with(&["slow"]).await;
        let _s = broker
            .subscribe(
                "slow",
                handler_fn(|msg: Message| async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Some(Response::ok(msg.payload))
                }),
            )
            .await;

        let msg = Message::new("a", "slow", MessageKind::Request, Value::Null);
        let err = broker.request(msg, Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::RequestTimeout { .. }));
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_first_settlement_wins() {
        let broker = broker_with(&["twice"]).await;
        let responder = broker.clone();
        let second_accepted = Arc::new(AtomicUsize::new(0));
        let flag = second_accepted.clone();
        let _s = broker
            .subscribe(
                "twice",
                handler_fn(move |msg: Message| {
                    let responder = responder.clone();
                    let flag = flag.clone();
                    async move {
                        let id = msg.correlation_id().to_string();
                        responder.respond(&id, Response::ok(serde_json::json!("first"))).await;
                        if responder.respond(&id, Response::err("late", "second")).await {
                            flag.fetch_add(1, Ordering::SeqCst);
                        }
                        // Returned reply is a third attempt and must also be ignored
                        Some(Response::err("late", "third"))
                    }
                }),
            )
            .await;

        let msg = Message::new("a", "twice", MessageKind::Request, Value::Null);
        let response = broker.request(msg, Duration::from_millis(100)).await.unwrap();
        assert_eq!(response.data, Some(serde_json::json!("first")));
        assert_eq!(second_accepted.load(Ordering::SeqCst), 0);

        // Let the timeout window pass; nothing else surfaces
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_routing_error_cleans_pending() {
        let broker = broker_with(&[]).await;
        let msg = Message::new("a", "ghost", MessageKind::Request, Value::Null);
        let err = broker.request(msg, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, OrchestrationError::AgentNotFound("ghost".to_string()));
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_explicit_correlation_id() {
        let broker = broker_with(&["echo"]).await;
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let _s = broker
            .subscribe(
                "echo",
                handler_fn(move |msg: Message| {
                    let captured = captured.clone();
                    async move {
                        *captured.lock().unwrap() = Some(msg.correlation_id().to_string());
                        Some(Response::ok_empty())
                    }
                }),
            )
            .await;

        let msg = Message::new("a", "echo", MessageKind::Request, Value::Null)
            .with_correlation_id("conv-42");
        broker.request(msg, Duration::from_secs(1)).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("conv-42"));
    }

    #[tokio::test]
    async fn test_request_answered_while_handler_keeps_running() {
        let broker = broker_with(&["worker"]).await;
        let responder = broker.clone();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        let _s = broker
            .subscribe(
                "worker",
                handler_fn(move |msg: Message| {
                    let responder = responder.clone();
                    let done = done.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        responder
                            .respond(msg.correlation_id(), Response::ok(serde_json::json!("early")))
                            .await;
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        None
                    }
                }),
            )
            .await;

        let msg = Message::new("a", "worker", MessageKind::Request, Value::Null);
        let response = broker.request(msg, Duration::from_millis(100)).await.unwrap();
        assert_eq!(response.data, Some(serde_json::json!("early")));
        assert_eq!(broker.pending_count().await, 0);

        // The handler was not cut short by the early return
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_not_held_up_by_slow_subscriber() {
        let broker = broker_with(&["worker"]).await;
        let _fast = broker.subscribe("worker", echo_handler()).await;
        let _slow = broker
            .subscribe(
                "worker",
                handler_fn(|_msg| async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    None
                }),
            )
            .await;

        let msg = Message::new("a", "worker", MessageKind::Request, serde_json::json!(7));
        let started = std::time::Instant::now();
        let response = broker.request(msg, Duration::from_millis(100)).await.unwrap();
        assert_eq!(response.data, Some(serde_json::json!(7)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_request_rejects_correlation_id_in_flight() {
        let broker = broker_with(&["worker"]).await;
        let _s = broker
            .subscribe(
                "worker",
                handler_fn(|msg: Message| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Some(Response::ok(msg.payload))
                }),
            )
            .await;

        let first = tokio::spawn({
            let broker = broker.clone();
            async move {
                let msg = Message::new("a", "worker", MessageKind::Request, serde_json::json!(1))
                    .with_correlation_id("c");
                broker.request(msg, Duration::from_secs(1)).await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let msg = Message::new("a", "worker", MessageKind::Request, serde_json::json!(2))
            .with_correlation_id("c");
        let err = broker.request(msg, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, OrchestrationError::DuplicateCorrelation("c".to_string()));

        // The rejected request left the first one's slot intact
        let response = first.await.unwrap().unwrap();
        assert_eq!(response.data, Some(serde_json::json!(1)));
        assert_eq!(broker.pending_count().await, 0);

        // Once settled the id is free again
        let msg = Message::new("a", "worker", MessageKind::Request, serde_json::json!(3))
            .with_correlation_id("c");
        let response = broker.request(msg, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.data, Some(serde_json::json!(3)));
    }

    #[tokio::test]
    async fn test_dropped_request_releases_slot() {
        let broker = broker_with(&["silent"]).await;
        let msg = Message::new("a", "silent", MessageKind::Request, Value::Null);
        let id = msg.id.clone();

        let outer = tokio::time::timeout(
            Duration::from_millis(20),
            broker.request(msg, Duration::from_secs(5)),
        )
        .await;
        assert!(outer.is_err());
        assert_eq!(broker.pending_count().await, 0);
        assert!(!broker.respond(&id, Response::ok_empty()).await);
    }

    #[tokio::test]
    async fn test_respond_without_pending() {
        let broker = broker_with(&[]).await;
        assert!(!broker.respond("nobody", Response::ok_empty()).await);
    }

    #[tokio::test]
    async fn test_broadcast_skips_source_and_disabled() {
        let broker = broker_with(&["hub", "a", "b", "c"]).await;
        broker.registry().set_enabled("c", false).await;

        let counter = Arc::new(AtomicUsize::new(0));
        for id in ["hub", "a", "b", "c"] {
            // Dropping a Subscription does not unsubscribe
            let _ = broker.subscribe(id, counting_handler(counter.clone())).await;
        }

        let report = broker
            .broadcast("hub", MessageKind::Broadcast, serde_json::json!("ping"), None)
            .await;
        let mut delivered = report.delivered.clone();
        delivered.sort();
        assert_eq!(delivered, vec!["a".to_string(), "b".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_broadcast_with_filter() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register(AgentDescriptor::new("hub", "core", "Hub")).await.unwrap();
        registry.register(AgentDescriptor::new("sales", "business", "Sales")).await.unwrap();
        registry.register(AgentDescriptor::new("hr", "people", "HR")).await.unwrap();
        let broker = MessageBroker::new(registry);

        let only_business = |agent: &AgentDescriptor| agent.agent_type == "business";
        let report = broker
            .broadcast("hub", MessageKind::Event, Value::Null, Some(&only_business))
            .await;
        assert_eq!(report.delivered, vec!["sales".to_string()]);
    }
}
