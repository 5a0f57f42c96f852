//! In-process broadcast center.

use parking_lot::RwLock;
use tracing::trace;

use crate::domain::lifeline::ObjectId;
use crate::domain::ports::{BroadcastCenter, HandlerToken, Notification, NotificationHandler};

struct Subscriber {
    token: HandlerToken,
    name: String,
    poster: Option<ObjectId>,
    handler: NotificationHandler,
}

/// Synchronous [`BroadcastCenter`]: `post` runs every matching handler on
/// the posting thread before returning.
#[derive(Default)]
pub struct LocalBroadcastCenter {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl LocalBroadcastCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handlers subscribed to `name`, whatever their poster filter.
    pub fn handler_count(&self, name: &str) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|s| s.name == name)
            .count()
    }
}

impl BroadcastCenter for LocalBroadcastCenter {
    fn add_handler(&self, name: &str, poster: Option<ObjectId>, handler: NotificationHandler) -> HandlerToken {
        let token = HandlerToken::next();
        self.subscribers.write().push(Subscriber {
            token,
            name: name.to_string(),
            poster,
            handler,
        });
        token
    }

    fn remove_handler(&self, token: HandlerToken) -> bool {
        let removed = {
            let mut subscribers = self.subscribers.write();
            let position = subscribers.iter().position(|s| s.token == token);
            position.map(|i| subscribers.remove(i))
        };
        removed.is_some()
    }

    fn post(&self, notification: Notification) {
        let poster = notification.poster_id();
        let handlers: Vec<NotificationHandler> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.name == notification.name)
            .filter(|s| s.poster.is_none() || s.poster == poster)
            .map(|s| s.handler.clone())
            .collect();
        trace!(name = %notification.name, handlers = handlers.len(), "Posting notification");
        for handler in handlers {
            handler(&notification);
        }
    }
}

impl std::fmt::Debug for LocalBroadcastCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBroadcastCenter")
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}
