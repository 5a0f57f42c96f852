//! Observations of control events (taps, value changes, editing).

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use super::{Observation, ObservationBuilder, ObservationKind, Registry};
use crate::domain::lifeline::{Anchor, ObjectId};
use crate::domain::ports::{ControlEvent, ControlEventSource, ControlEvents, ControlHandler, HandlerToken};
use crate::error::{Error, Result};

pub type ControlEventObservation = Observation<ControlEventKind>;

pub struct ControlEventKind {
    events: ControlEvents,
    source: Weak<dyn ControlEventSource>,
    token: Mutex<Option<HandlerToken>>,
}

impl ControlEventKind {
    pub fn events(&self) -> ControlEvents {
        self.events
    }
}

/// What a control-event callback sees.
#[derive(Debug, Clone)]
pub struct ControlTrigger {
    /// The control that sent the event
    pub control: Anchor,
    pub event: ControlEvent,
}

impl ObservationKind for ControlEventKind {
    type Trigger = ControlTrigger;
    const NAME: &'static str = "control_event";

    fn register_internal(observation: &Arc<Observation<Self>>) -> Result<()> {
        let kind = observation.kind();
        let source = kind
            .source
            .upgrade()
            .ok_or_else(|| Error::NotFound("control is gone".to_string()))?;
        let this = Arc::downgrade(observation);
        let handler: ControlHandler = Arc::new(move |event: &ControlEvent| {
            let Some(observation) = this.upgrade() else {
                return;
            };
            let Some(control) = observation.object().cloned() else {
                return;
            };
            let event = event.clone();
            observation.invoke_on_queue_after(move || ControlTrigger { control, event });
        });
        *kind.token.lock() = Some(source.add_action(kind.events, handler));
        Ok(())
    }

    fn deregister_internal(observation: &Observation<Self>) {
        let kind = observation.kind();
        let Some(token) = kind.token.lock().take() else {
            return;
        };
        match kind.source.upgrade() {
            Some(source) => {
                source.remove_action(token);
            }
            None => trace!(observation_id = %observation.id(), "Control already gone"),
        }
    }
}

impl Observation<ControlEventKind> {
    /// Start building an observation of `events` on `control`.
    pub fn builder<C: ControlEventSource>(
        control: &Arc<C>,
        events: ControlEvents,
    ) -> ObservationBuilder<ControlEventKind> {
        let weak: Weak<C> = Arc::downgrade(control);
        let source: Weak<dyn ControlEventSource> = weak;
        let builder = ObservationBuilder::new(ControlEventKind {
            events,
            source,
            token: Mutex::new(None),
        })
        .object(control);
        if events.is_empty() {
            builder.problem("control event mask must not be empty")
        } else {
            builder
        }
    }

    pub fn events(&self) -> ControlEvents {
        self.kind().events()
    }

    /// The event being delivered. `None` outside a callback.
    pub fn control_event(&self) -> Option<Arc<ControlTrigger>> {
        self.trigger()
    }

    /// Remove the first observation of exactly `events` on `control`.
    pub fn remove_for(observer: Option<ObjectId>, control: ObjectId, events: ControlEvents) -> bool {
        Self::remove_for_in(&Registry::global(), observer, control, events)
    }

    pub fn remove_for_in(
        registry: &Registry,
        observer: Option<ObjectId>,
        control: ObjectId,
        events: ControlEvents,
    ) -> bool {
        match registry.find_typed::<ControlEventKind>(observer, Some(control), |o| o.events() == events) {
            Some(observation) => {
                observation.remove();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Control;
    use crate::domain::lifeline::Lifecycle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_matching_events_trigger_callback() {
        let registry = Arc::new(Registry::new());
        let button = Control::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = fired.clone();

        let _obs = ControlEventObservation::builder(&button, ControlEvents::TOUCH_UP_INSIDE)
            .registry(registry)
            .callback(move |o| {
                let trigger = o.control_event().unwrap();
                f.lock().push((trigger.control.id(), trigger.event.events));
            })
            .build()
            .unwrap();

        button.send_actions(ControlEvents::TOUCH_DOWN);
        button.send_actions(ControlEvents::TOUCH_UP_INSIDE | ControlEvents::VALUE_CHANGED);

        let fired = fired.lock();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, button.object_id());
        assert_eq!(fired[0].1, ControlEvents::TOUCH_UP_INSIDE);
    }

    #[test]
    fn test_remove_for_requires_same_mask() {
        let registry = Arc::new(Registry::new());
        let button = Control::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _obs = ControlEventObservation::builder(&button, ControlEvents::VALUE_CHANGED)
            .registry(registry.clone())
            .callback(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        assert!(!ControlEventObservation::remove_for_in(
            &registry,
            None,
            button.object_id(),
            ControlEvents::TOUCH_DOWN
        ));
        assert!(ControlEventObservation::remove_for_in(
            &registry,
            None,
            button.object_id(),
            ControlEvents::VALUE_CHANGED
        ));
        assert_eq!(button.action_count(), 0);
        button.send_actions(ControlEvents::VALUE_CHANGED);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
