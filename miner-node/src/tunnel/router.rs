//! Message classification, listeners and handler dispatch.

use std::sync::{Arc, Mutex, MutexGuard};

use miner_common::TunnelMessage;

use super::{Direction, HandlerContext, HandlerRegistry, TunnelError, TunnelEvent};

type Predicate = Box<dyn Fn(&TunnelMessage) -> bool + Send + Sync>;
type Callback = Box<dyn Fn(&TunnelMessage) + Send + Sync>;

/// Ephemeral observer of tunnel messages.
///
/// A listener whose matcher accepts a message has its callback invoked. It is
/// then removed unless its `once` predicate returns `false` for that message.
pub struct Listener {
    matcher: Predicate,
    callback: Callback,
    once: Option<Predicate>,
}

impl Listener {
    pub fn new(
        matcher: impl Fn(&TunnelMessage) -> bool + Send + Sync + 'static,
        callback: impl Fn(&TunnelMessage) + Send + Sync + 'static,
    ) -> Self {
        Self {
            matcher: Box::new(matcher),
            callback: Box::new(callback),
            once: None,
        }
    }

    /// Decide per matched message whether the listener is done.
    pub fn once(mut self, predicate: impl Fn(&TunnelMessage) -> bool + Send + Sync + 'static) -> Self {
        self.once = Some(Box::new(predicate));
        self
    }

    /// Keep the listener for every match.
    pub fn persistent(self) -> Self {
        self.once(|_| false)
    }

    fn done_after(&self, message: &TunnelMessage) -> bool {
        self.once.as_ref().map_or(true, |once| once(message))
    }
}

/// Routes tunnel messages to their handlers.
pub struct MessageRouter {
    registry: Arc<HandlerRegistry>,
    listeners: Mutex<Vec<Listener>>,
    ctx: HandlerContext,
}

impl MessageRouter {
    pub fn new(registry: Arc<HandlerRegistry>, ctx: HandlerContext) -> Self {
        Self {
            registry,
            listeners: Mutex::new(Vec::new()),
            ctx,
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn context(&self) -> &HandlerContext {
        &self.ctx
    }

    pub fn add_listener(&self, listener: Listener) {
        self.listeners().push(listener);
    }

    pub fn clear_listeners(&self) {
        self.listeners().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Dispatch one message.
    ///
    /// Loopback messages are dropped without any event. Messages that are
    /// neither to nor from the local peer are dropped with a warning.
    pub async fn dispatch(&self, message: &TunnelMessage) -> Result<(), TunnelError> {
        if message.is_loopback() {
            tracing::debug!("Ignoring loopback {} message from {}", message.message_type, message.from);
            return Ok(());
        }

        self.ctx.events.emit(TunnelEvent::MessageReceived(message.clone()));

        let Some(direction) = self.classify(message) else {
            tracing::warn!(
                "Ignoring {} message not addressed to this node: {} -> {} (local: {})",
                message.message_type,
                message.from,
                message.to,
                self.ctx
                    .identity
                    .get()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "unbound".to_string())
            );
            return Ok(());
        };

        self.trigger_listeners(message);

        let result = match self.registry.get(&message.message_type, direction) {
            Some(handler) => handler.handle(message, &self.ctx).await,
            None => {
                tracing::error!("Cannot handle {} message {}", direction, message.message_type);
                Err(TunnelError::UnknownMessageType {
                    message_type: message.message_type.clone(),
                    direction,
                })
            }
        };

        if let Err(e) = &result {
            self.ctx.events.emit(TunnelEvent::MessageFailed {
                message: message.clone(),
                error: e.to_string(),
            });
        }

        result
    }

    /// Dispatch a message, then register `listener`.
    ///
    /// The listener is added after the handler ran, so it never sees the
    /// message that installed it.
    pub async fn dispatch_with_listener(
        &self,
        message: &TunnelMessage,
        listener: Listener,
    ) -> Result<(), TunnelError> {
        self.dispatch(message).await?;
        self.add_listener(listener);
        Ok(())
    }

    /// Write a message to the gateway.
    pub async fn send(&self, message: &TunnelMessage) -> Result<(), TunnelError> {
        self.ctx.send(message).await
    }

    fn classify(&self, message: &TunnelMessage) -> Option<Direction> {
        let local = self.ctx.identity.get()?;
        if message.to == local {
            Some(Direction::Income)
        } else if message.from == local {
            Some(Direction::Outcome)
        } else {
            None
        }
    }

    fn trigger_listeners(&self, message: &TunnelMessage) {
        // Callbacks run without the lock held so they may add listeners
        let current = std::mem::take(&mut *self.listeners());
        let mut remaining = Vec::with_capacity(current.len());

        for listener in current {
            if (listener.matcher)(message) {
                (listener.callback)(message);
                if listener.done_after(message) {
                    continue;
                }
            }
            remaining.push(listener);
        }

        let mut guard = self.listeners();
        let added = std::mem::take(&mut *guard);
        *guard = remaining;
        guard.extend(added);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{ConnectionManager, EventBus, MessageHandler, NodeIdentity};
    use crate::test_util::MemoryTransport;
    use async_trait::async_trait;
    use miner_common::PeerId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _: &TunnelMessage, _: &HandlerContext) -> Result<(), TunnelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push("handler");
            Ok(())
        }
    }

    struct Fixture {
        router: MessageRouter,
        handler: Arc<Counting>,
        events: EventBus,
        transport: Arc<MemoryTransport>,
        connection: Arc<ConnectionManager>,
    }

    fn fixture() -> Fixture {
        let handler = Arc::new(Counting::default());
        let mut registry = HandlerRegistry::new();
        registry
            .register("task_request", Direction::Income, handler.clone())
            .unwrap();

        let identity = NodeIdentity::new();
        identity.set(PeerId::from("dev-1"));
        let events = EventBus::default();
        let transport = Arc::new(MemoryTransport::new());
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionManager::new(
            transport.clone(),
            identity.clone(),
            events.clone(),
            inbound_tx,
        ));
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let ctx = HandlerContext {
            identity,
            connection: connection.clone(),
            events: events.clone(),
            outbound: outbound_tx,
        };

        Fixture {
            router: MessageRouter::new(Arc::new(registry), ctx),
            handler,
            events,
            transport,
            connection,
        }
    }

    fn income(message_type: &str) -> TunnelMessage {
        TunnelMessage::new(message_type, PeerId::from("gateway"), PeerId::from("dev-1"), json!({}))
    }

    #[tokio::test]
    async fn test_loopback_is_dropped_silently() {
        let f = fixture();
        let mut subscriber = f.events.subscribe();

        let message = TunnelMessage::new("task_request", PeerId::from("dev-1"), PeerId::from("dev-1"), json!({}));
        f.router.dispatch(&message).await.unwrap();

        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 0);
        assert!(subscriber.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_income_message_reaches_handler() {
        let f = fixture();
        let mut subscriber = f.events.subscribe();

        f.router.dispatch(&income("task_request")).await.unwrap();

        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(subscriber.try_recv().unwrap(), TunnelEvent::MessageReceived(_)));
    }

    #[tokio::test]
    async fn test_unaddressed_message_is_dropped() {
        let f = fixture();
        let message = TunnelMessage::new("task_request", PeerId::from("gateway"), PeerId::from("dev-2"), json!({}));
        f.router.dispatch(&message).await.unwrap();
        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_fails_and_router_stays_usable() {
        let f = fixture();
        let mut subscriber = f.events.subscribe();

        let err = f.router.dispatch(&income("mystery")).await.unwrap_err();
        assert_eq!(
            err,
            TunnelError::UnknownMessageType {
                message_type: "mystery".to_string(),
                direction: Direction::Income,
            }
        );
        assert!(matches!(subscriber.try_recv().unwrap(), TunnelEvent::MessageReceived(_)));
        assert!(matches!(subscriber.try_recv().unwrap(), TunnelEvent::MessageFailed { .. }));

        f.router.dispatch(&income("task_request")).await.unwrap();
        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_once_listener_fires_exactly_once() {
        let f = fixture();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        f.router.add_listener(
            Listener::new(
                |m| m.message_type == "task_request",
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .once(|_| true),
        );

        for _ in 0..3 {
            f.router.dispatch(&income("task_request")).await.unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(f.router.listener_count(), 0);
        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_listener_without_once_is_removed_after_match() {
        let f = fixture();
        f.router.add_listener(Listener::new(|_| true, |_| {}));
        f.router.dispatch(&income("task_request")).await.unwrap();
        assert_eq!(f.router.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_non_matching_and_persistent_listeners_are_kept() {
        let f = fixture();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        f.router.add_listener(Listener::new(|m| m.message_type == "other", |_| {}));
        f.router.add_listener(
            Listener::new(
                |_| true,
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .persistent(),
        );

        f.router.dispatch(&income("task_request")).await.unwrap();
        f.router.dispatch(&income("task_request")).await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(f.router.listener_count(), 2);
    }

    #[tokio::test]
    async fn test_listeners_run_before_handler() {
        let f = fixture();
        let order = f.handler.order.clone();
        let seen = order.clone();
        f.router.add_listener(Listener::new(|_| true, move |_| seen.lock().unwrap().push("listener")));

        f.router.dispatch(&income("task_request")).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["listener", "handler"]);
    }

    #[tokio::test]
    async fn test_dispatch_with_listener_does_not_self_trigger() {
        let f = fixture();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let listener = Listener::new(
            |_| true,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        f.router
            .dispatch_with_listener(&income("task_request"), listener)
            .await
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(f.router.listener_count(), 1);

        f.router.dispatch(&income("task_request")).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_emits_sent_or_failed() {
        let f = fixture();
        f.connection.connect("https://gw.test", "C1", "/").await.unwrap();
        let mut subscriber = f.events.subscribe();
        let message = TunnelMessage::new("pong", PeerId::from("dev-1"), PeerId::from("gateway"), json!({}));

        f.router.send(&message).await.unwrap();
        assert!(matches!(subscriber.try_recv().unwrap(), TunnelEvent::MessageSent(_)));

        f.transport.fail_sends(true);
        let err = f.router.send(&message).await.unwrap_err();
        assert!(matches!(err, TunnelError::MessageSend(_)));
        assert!(matches!(subscriber.try_recv().unwrap(), TunnelEvent::MessageFailed { .. }));
    }
}
