//! Named, prioritized event channels.
//!
//! Listeners are invoked synchronously when a channel is emitted, in
//! priority order from 0 (earliest) to 9 (latest). Listeners sharing a
//! priority run in registration order. Listeners registered without a label
//! hear every channel and run after that channel's own listeners within the
//! same priority band.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, trace};
use vitalsim_env::{RunContext, SimTime, StepSize};

use crate::error::Result;

pub const POST_SETUP: &str = "post_setup";
pub const TIME_STEP_PREPARE: &str = "time_step__prepare";
pub const TIME_STEP: &str = "time_step";
pub const TIME_STEP_CLEANUP: &str = "time_step__cleanup";
pub const COLLECT_METRICS: &str = "collect_metrics";
pub const SIMULATION_END: &str = "simulation_end";

/// Number of priority bands.
pub const PRIORITY_LEVELS: usize = 10;
pub const DEFAULT_PRIORITY: usize = 5;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("priority {priority} for '{label}' is outside 0..=9")]
    InvalidPriority { label: String, priority: usize },

    #[error("channel '{0}' is already being emitted or modified")]
    Reentrant(String),
}

/// Passed to every listener of one emission.
#[derive(Debug, Clone)]
pub struct Event {
    /// Simulants the event concerns, usually the whole population.
    pub index: Vec<usize>,
    /// The instant the current step advances to.
    pub time: SimTime,
    pub step_size: StepSize,
}

pub type Listener = Box<dyn FnMut(&Event) -> Result<()>>;

#[derive(Default)]
struct Channel {
    bands: [Vec<Listener>; PRIORITY_LEVELS],
}

impl Channel {
    fn len(&self) -> usize {
        self.bands.iter().map(Vec::len).sum()
    }
}

type ChannelMap = IndexMap<Option<String>, Rc<RefCell<Channel>>>;

/// Registry of event channels. Clones share the same channels.
#[derive(Clone)]
pub struct EventManager {
    channels: Rc<RefCell<ChannelMap>>,
    context: Rc<dyn RunContext>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("labels", &self.labels())
            .finish()
    }
}

impl EventManager {
    pub fn new(context: Rc<dyn RunContext>) -> Self {
        Self {
            channels: Rc::new(RefCell::new(IndexMap::new())),
            context,
        }
    }

    fn channel(&self, label: Option<&str>) -> Rc<RefCell<Channel>> {
        let mut channels = self.channels.borrow_mut();
        Rc::clone(
            channels
                .entry(label.map(str::to_string))
                .or_insert_with(|| Rc::new(RefCell::new(Channel::default()))),
        )
    }

    /// Adds a listener to `label`, or to every channel if `label` is `None`.
    pub fn register_listener<F>(&self, label: Option<&str>, priority: usize, listener: F) -> std::result::Result<(), EventError>
    where
        F: FnMut(&Event) -> Result<()> + 'static,
    {
        let name = label.unwrap_or("*");
        if priority >= PRIORITY_LEVELS {
            return Err(EventError::InvalidPriority {
                label: name.to_string(),
                priority,
            });
        }
        let channel = self.channel(label);
        let mut channel = channel
            .try_borrow_mut()
            .map_err(|_| EventError::Reentrant(name.to_string()))?;
        channel.bands[priority].push(Box::new(listener));
        debug!(label = name, priority, "registered event listener");
        Ok(())
    }

    /// Returns a handle that emits `label`.
    pub fn get_emitter(&self, label: &str) -> Emitter {
        self.channel(Some(label));
        Emitter {
            label: label.to_string(),
            manager: self.clone(),
        }
    }

    /// Emits `label` for `index` at the upcoming step boundary.
    pub fn emit(&self, label: &str, index: Vec<usize>) -> Result<()> {
        let event = Event {
            index,
            time: self.context.next_time(),
            step_size: self.context.step_size(),
        };
        self.emit_event(label, &event)
    }

    /// Emits a prepared event.
    ///
    /// Emitting a channel from one of its own listeners fails. Wildcard
    /// listeners do not hear emissions nested inside another emission.
    pub fn emit_event(&self, label: &str, event: &Event) -> Result<()> {
        let channel = self.channel(Some(label));
        let mut channel = channel
            .try_borrow_mut()
            .map_err(|_| EventError::Reentrant(label.to_string()))?;
        let wildcard = self.channel(None);
        let mut wildcard = match wildcard.try_borrow_mut() {
            Ok(w) => Some(w),
            Err(_) => {
                debug!(label, "skipping wildcard listeners for nested emission");
                None
            }
        };

        trace!(label, listeners = channel.len(), simulants = event.index.len(), "emitting");
        for priority in 0..PRIORITY_LEVELS {
            for listener in channel.bands[priority].iter_mut() {
                listener(event)?;
            }
            if let Some(wildcard) = wildcard.as_mut() {
                for listener in wildcard.bands[priority].iter_mut() {
                    listener(event)?;
                }
            }
        }
        Ok(())
    }

    /// Labels of every known channel.
    pub fn labels(&self) -> Vec<String> {
        self.channels.borrow().keys().flatten().cloned().collect()
    }

    /// Number of listeners on a channel, excluding wildcard listeners.
    pub fn listener_count(&self, label: Option<&str>) -> usize {
        self.channels
            .borrow()
            .get(&label.map(str::to_string))
            .map(|c| c.borrow().len())
            .unwrap_or(0)
    }
}

/// Emits one channel.
#[derive(Clone)]
pub struct Emitter {
    label: String,
    manager: EventManager,
}

impl Emitter {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn emit(&self, index: Vec<usize>) -> Result<()> {
        self.manager.emit(&self.label, index)
    }
}
