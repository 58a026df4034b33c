//! Digital-input extension behavior.
//!
//! Input changes come from outside the engine (the operator console or
//! a simulation); the behavior publishes the bitmask whenever it
//! changes while the extension is Online.

use std::sync::{Arc, Mutex};

use crate::device::BehaviorSender;
use crate::devices::DeviceBehavior;
use crate::lifecycle::LinkState;
use crate::protocol::{Command, NatFrame};

#[derive(Default)]
struct InputState {
    mask: u32,
    dirty: bool,
}

/// Shared handle for flipping inputs from outside the device task.
#[derive(Clone, Default)]
pub struct DigitalInputs {
    shared: Arc<Mutex<InputState>>,
}

impl DigitalInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the input bitmask; a change is published on the next poll.
    pub fn set(&self, mask: u32) {
        let mut state = self.shared.lock().unwrap();
        if state.mask != mask {
            state.mask = mask;
            state.dirty = true;
        }
    }

    pub fn mask(&self) -> u32 {
        self.shared.lock().unwrap().mask
    }

    fn take_dirty(&self) -> Option<u32> {
        let mut state = self.shared.lock().unwrap();
        if state.dirty {
            state.dirty = false;
            Some(state.mask)
        } else {
            None
        }
    }

    fn mark_dirty(&self) {
        self.shared.lock().unwrap().dirty = true;
    }
}

pub struct DigitalInputBehavior {
    inputs: DigitalInputs,
}

impl DigitalInputBehavior {
    pub fn new(inputs: DigitalInputs) -> Self {
        Self { inputs }
    }
}

impl DeviceBehavior for DigitalInputBehavior {
    fn on_state(&mut self, state: LinkState, _reason: &str) {
        // Publish the current mask once the Miniserver can hear us.
        if state == LinkState::Online {
            self.inputs.mark_dirty();
        }
    }

    fn poll(&mut self, sender: &mut BehaviorSender<'_>) {
        if let Some(mask) = self.inputs.take_dirty() {
            sender.send(Command::DigitalValue, NatFrame::pack(0, 0, mask));
        }
    }
}
