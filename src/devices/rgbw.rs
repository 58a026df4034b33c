//! RGBW actuator behavior for the dimmer and LED-spot Tree devices.

use tracing::debug;

use crate::config::DeviceConfig;
use crate::device::BehaviorSender;
use crate::devices::DeviceBehavior;
use crate::protocol::{Command, NatFrame};

/// Receives the simulated hardware effect of channel changes.
pub trait RgbwSink: Send {
    fn set_channels(&mut self, red: u8, green: u8, blue: u8, white: u8);

    /// Visual identify signal. Default: nothing.
    fn identify(&mut self, _active: bool) {}
}

/// Behavior shared by the RGBW-24V dimmer and the RGBW/WW LED spots;
/// the device type lives in the identity.
pub struct RgbwDimmer {
    sink: Box<dyn RgbwSink>,
    channels: [u8; 4],
    led_sync_offset: u8,
}

impl RgbwDimmer {
    pub fn new(sink: Box<dyn RgbwSink>) -> Self {
        Self {
            sink,
            channels: [0; 4],
            led_sync_offset: 0,
        }
    }

    pub fn channels(&self) -> [u8; 4] {
        self.channels
    }
}

impl DeviceBehavior for RgbwDimmer {
    fn on_config(&mut self, config: &DeviceConfig) {
        self.led_sync_offset = config.led_sync_offset;
    }

    fn on_identify(&mut self, active: bool) {
        self.sink.identify(active);
    }

    fn handle_command(&mut self, frame: &NatFrame, _sender: &mut BehaviorSender<'_>) -> bool {
        if frame.command() != Some(Command::RgbwValue) {
            return false;
        }
        self.channels = [frame.data[0], frame.data[1], frame.data[2], frame.data[3]];
        debug!(channels = ?self.channels, "rgbw value applied");
        let [r, g, b, w] = self.channels;
        self.sink.set_channels(r, g, b, w);
        true
    }
}
