//! A control that emits [`ControlEvents`].

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use crate::domain::lifeline::{Lifecycle, Lifeline};
use crate::domain::ports::{ControlEvent, ControlEventSource, ControlEvents, ControlHandler, HandlerToken};

struct Action {
    token: HandlerToken,
    events: ControlEvents,
    handler: ControlHandler,
}

/// Headless control (a button, a text field) that runs actions for events.
#[derive(Default)]
pub struct Control {
    lifeline: Lifeline,
    actions: RwLock<Vec<Action>>,
}

impl Control {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run every action whose mask intersects `events`.
    pub fn send_actions(&self, events: ControlEvents) {
        let matching: Vec<(ControlEvents, ControlHandler)> = self
            .actions
            .read()
            .iter()
            .filter(|a| a.events.intersects(events))
            .map(|a| (a.events & events, a.handler.clone()))
            .collect();
        let sender = self.object_id();
        let timestamp = Utc::now();
        for (fired, handler) in matching {
            handler(&ControlEvent {
                events: fired,
                sender,
                timestamp,
            });
        }
    }

    pub fn action_count(&self) -> usize {
        self.actions.read().len()
    }
}

impl Lifecycle for Control {
    fn lifeline(&self) -> &Lifeline {
        &self.lifeline
    }
}

impl ControlEventSource for Control {
    fn add_action(&self, events: ControlEvents, handler: ControlHandler) -> HandlerToken {
        let token = HandlerToken::next();
        self.actions.write().push(Action { token, events, handler });
        token
    }

    fn remove_action(&self, token: HandlerToken) -> bool {
        let removed = {
            let mut actions = self.actions.write();
            let position = actions.iter().position(|a| a.token == token);
            position.map(|i| actions.remove(i))
        };
        removed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_send_actions_intersects_masks() {
        let control = Control::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = fired.clone();
        control.add_action(
            ControlEvents::ALL_EDITING_EVENTS,
            Arc::new(move |e: &ControlEvent| f.lock().push(e.events)),
        );

        control.send_actions(ControlEvents::TOUCH_DOWN);
        control.send_actions(ControlEvents::EDITING_CHANGED | ControlEvents::TOUCH_DOWN);

        assert_eq!(*fired.lock(), vec![ControlEvents::EDITING_CHANGED]);
    }
}
