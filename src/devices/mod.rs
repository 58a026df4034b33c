//! Concrete device behaviors.
//!
//! The protocol engine handles everything generic; a behavior plugs in
//! the device-specific reactions: actuator commands, input publishing,
//! identify signalling. Simulated hardware effects live behind the sink
//! traits and stay outside the engine.

use crate::config::DeviceConfig;
use crate::device::BehaviorSender;
use crate::fragment::FragmentedFrame;
use crate::lifecycle::LinkState;
use crate::protocol::NatFrame;

pub mod digital_input;
pub mod rgbw;

pub use digital_input::{DigitalInputBehavior, DigitalInputs};
pub use rgbw::{RgbwDimmer, RgbwSink};

/// Hooks a concrete device implements on top of the device base.
///
/// All hooks default to "not interested". Command hooks run only while
/// the device is Online; a Parked device answers lifecycle commands
/// but no control commands.
pub trait DeviceBehavior: Send {
    /// Lifecycle transition, with the reason that caused it.
    fn on_state(&mut self, _state: LinkState, _reason: &str) {}

    /// A configuration record was applied.
    fn on_config(&mut self, _config: &DeviceConfig) {}

    /// Identify mode entered or left (visual signal).
    fn on_identify(&mut self, _active: bool) {}

    /// A verified firmware image was accepted.
    fn on_firmware_applied(&mut self, _version: u32) {}

    /// Periodic hook while Online; may publish spontaneous frames.
    fn poll(&mut self, _sender: &mut BehaviorSender<'_>) {}

    /// Device-specific plain command. Return `true` when handled.
    fn handle_command(&mut self, _frame: &NatFrame, _sender: &mut BehaviorSender<'_>) -> bool {
        false
    }

    /// Device-specific fragmented command. Return `true` when handled.
    fn handle_fragmented(
        &mut self,
        _message: &FragmentedFrame,
        _sender: &mut BehaviorSender<'_>,
    ) -> bool {
        false
    }
}

/// Behavior with no device-specific reactions, used by the bare Tree
/// base extension.
pub struct NullBehavior;

impl DeviceBehavior for NullBehavior {}
