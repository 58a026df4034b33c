//! Tree-extension router: hosts child Tree devices and fans inbound
//! frames out to them.
//!
//! The extension is the only NAT endpoint on the Link bus for its group.
//! Children share its NatId and are addressed by their assigned
//! `DeviceNat`; the extension decides per frame whether it is for
//! itself, for one child, or a broadcast.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ResetReason;
use crate::crypto::CryptoContext;
use crate::device::{DeviceCore, DeviceIdentity, LinkNode, Outbox};
use crate::devices::{DeviceBehavior, NullBehavior};
use crate::lifecycle::LinkState;
use crate::protocol::{CanFrame, Command, NatFrame, BROADCAST_DEVICE, BROADCAST_NAT};

/// Physical branch of a Tree extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Left,
    Right,
}

impl Branch {
    /// Branch tag as reported in search responses.
    pub fn tag(self) -> u8 {
        match self {
            Branch::Left => 0x80,
            Branch::Right => 0x01,
        }
    }
}

/// Delay between consecutive child offers in the rediscovery cascade.
const CHILD_OFFER_SPACING: Duration = Duration::from_millis(50);

/// A Tree extension and the child devices behind it.
pub struct TreeExtension {
    extension: DeviceCore,
    children: Vec<DeviceCore>,
}

impl TreeExtension {
    pub fn new(identity: DeviceIdentity, crypto: Arc<CryptoContext>) -> Self {
        Self {
            extension: DeviceCore::new_extension(identity, crypto, Box::new(NullBehavior)),
            children: Vec::new(),
        }
    }

    /// Register a child Tree device on the given branch.
    pub fn add_device(
        &mut self,
        identity: DeviceIdentity,
        behavior: Box<dyn DeviceBehavior>,
        branch: Branch,
    ) {
        let crypto = Arc::clone(&self.extension.crypto);
        self.children
            .push(DeviceCore::new_tree(identity, crypto, behavior, branch));
    }

    pub fn extension(&self) -> &DeviceCore {
        &self.extension
    }

    pub fn extension_mut(&mut self) -> &mut DeviceCore {
        &mut self.extension
    }

    pub fn children(&self) -> &[DeviceCore] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [DeviceCore] {
        &mut self.children
    }

    fn sync_child_nats(&mut self) {
        let nat = self.extension.nat_id();
        for child in &mut self.children {
            child.set_parent_nat(nat);
        }
    }

    /// Ask each Offline child to emit its offer, spaced apart so the
    /// Miniserver sees them one by one.
    fn cascade_offers(&mut self, now: Instant) {
        let mut slot = 0u32;
        for child in &mut self.children {
            if child.state() == LinkState::Offline {
                child.schedule_offer_at(now + CHILD_OFFER_SPACING * slot);
                slot += 1;
            }
        }
    }
}

impl LinkNode for TreeExtension {
    fn handle_can(&mut self, now: Instant, frame: &CanFrame, out: &mut Outbox) {
        let Ok(frame) = NatFrame::decode(frame) else {
            return;
        };
        if !frame.from_server {
            return;
        }
        let nat = self.extension.nat_id();
        if frame.nat_id != nat && frame.nat_id != BROADCAST_NAT {
            return;
        }
        self.sync_child_nats();

        // Assignments route by serial, not by DeviceId: the confirm
        // carries the address the target is about to receive.
        if frame.command() == Some(Command::NatOfferConfirm) && !frame.fragmented {
            let serial = frame.val32();
            if serial == self.extension.serial() {
                self.extension.handle_frame(now, &frame, out);
            } else if let Some(child) =
                self.children.iter_mut().find(|c| c.serial() == serial)
            {
                child.handle_frame(now, &frame, out);
            }
            self.sync_child_nats();
            return;
        }

        match frame.device_id {
            0 => self.extension.handle_frame(now, &frame, out),
            BROADCAST_DEVICE => {
                // Extension first, so its own state (e.g. a fresh NAT)
                // is current before the fan-out.
                self.extension.handle_frame(now, &frame, out);
                if frame.command() == Some(Command::IdentifyUnknown) {
                    if self.extension.state() == LinkState::Online {
                        self.cascade_offers(now);
                    }
                } else {
                    for child in &mut self.children {
                        child.handle_frame(now, &frame, out);
                    }
                }
            }
            id => {
                if let Some(child) = self
                    .children
                    .iter_mut()
                    .find(|c| c.accepts_device_id(id))
                {
                    child.handle_frame(now, &frame, out);
                }
            }
        }
    }

    fn tick(&mut self, now: Instant, out: &mut Outbox) {
        self.extension.tick(now, out);
        if self.extension.state() == LinkState::Online {
            self.sync_child_nats();
            for child in &mut self.children {
                child.tick(now, out);
            }
        } else {
            // A Tree device holds no state without an online parent.
            for child in &mut self.children {
                if child.state() != LinkState::Offline {
                    child.reboot(now, ResetReason::Reconnect, "parent extension lost");
                }
            }
        }
    }

    fn shutdown(&mut self, out: &mut Outbox) {
        if self.extension.state() == LinkState::Online {
            self.extension.emit_set_offline(out);
        }
    }
}
