//! Device base: identity, owned protocol state and the send primitives.
//!
//! `DeviceCore` is the synchronous heart of every emulated device. It
//! owns the lifecycle state machine, the fragment assembler, the
//! firmware session and the configuration record, and turns inbound NAT
//! frames plus timer ticks into outbound frames collected in an
//! [`Outbox`]. The async shell in [`crate::runner`] owns the queues and
//! the CAN adapter.

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::config::{DeviceConfig, ResetReason};
use crate::crypto::{CryptoContext, SessionKeys};
use crate::firmware::UpdateSession;
use crate::fragment::FragmentAssembler;
use crate::devices::DeviceBehavior;
use crate::lifecycle::{Lifecycle, LifecycleEvent, LinkState};
use crate::protocol::{
    CanFrame, Command, NatFrame, BROADCAST_DEVICE, BROADCAST_NAT, UNASSIGNED_NAT,
};
use crate::tree::Branch;

/// Identity of one emulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: u32,
    pub device_type: u16,
    pub hardware_version: u8,
    pub firmware_version: u32,
    /// STM32 device-ID, 12 bytes.
    pub stm_id: [u8; 12],
}

impl DeviceIdentity {
    /// Identity of a Link extension; the STM32 device-ID comes from the
    /// crypto master configuration.
    pub fn extension(
        serial: u32,
        device_type: u16,
        hardware_version: u8,
        firmware_version: u32,
        crypto: &CryptoContext,
    ) -> Self {
        Self {
            serial,
            device_type,
            hardware_version,
            firmware_version,
            stm_id: crypto.master_device_id(),
        }
    }

    /// Identity of a Tree device; the STM32 device-ID is the serial
    /// repeated three times, as on real hardware.
    pub fn tree(serial: u32, device_type: u16, hardware_version: u8, firmware_version: u32) -> Self {
        let mut stm_id = [0u8; 12];
        for chunk in stm_id.chunks_exact_mut(4) {
            chunk.copy_from_slice(&serial.to_le_bytes());
        }
        Self {
            serial,
            device_type,
            hardware_version,
            firmware_version,
            stm_id,
        }
    }
}

/// Whether a core speaks NAT directly or through a Tree extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Extension,
    Tree,
}

/// One outbound unit produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A single NAT frame.
    Frame(NatFrame),
    /// A logical payload for the fragment emitter.
    Fragmented {
        nat_id: u8,
        device_id: u8,
        command: u8,
        data: Vec<u8>,
    },
}

/// Frames collected while processing one inbound frame or tick.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<Outbound>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: Outbound) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[Outbound] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<Outbound> {
        self.items
    }
}

/// Counters surfaced through the `statistics` web-service verb.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceStats {
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub fragment_crc_errors: u64,
    pub unknown_commands: u64,
}

pub struct DeviceCore {
    pub(crate) identity: DeviceIdentity,
    pub(crate) kind: DeviceKind,
    pub(crate) branch: Option<Branch>,
    pub(crate) crypto: Arc<CryptoContext>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) assembler: FragmentAssembler,
    pub(crate) update: UpdateSession,
    pub(crate) config: DeviceConfig,
    pub(crate) config_crc: u32,
    /// Assigned extension NAT; `UNASSIGNED_NAT` until confirmed. Tree
    /// devices carry their parent's NAT here, stamped by the router.
    pub(crate) nat_id: u8,
    /// Assigned Tree sub-address; always 0 for extensions.
    pub(crate) device_nat: u8,
    pub(crate) identify: bool,
    pub(crate) session: Option<SessionKeys>,
    pub(crate) reset_reason: ResetReason,
    pub(crate) behavior: Box<dyn DeviceBehavior>,
    pub(crate) stats: DeviceStats,
}

impl DeviceCore {
    /// Core for a device sitting directly on the Link bus.
    pub fn new_extension(
        identity: DeviceIdentity,
        crypto: Arc<CryptoContext>,
        behavior: Box<dyn DeviceBehavior>,
    ) -> Self {
        let config = DeviceConfig::default();
        let config_crc = config.crc();
        Self {
            identity,
            kind: DeviceKind::Extension,
            branch: None,
            crypto,
            lifecycle: Lifecycle::new(),
            assembler: FragmentAssembler::new(),
            update: UpdateSession::new(),
            config,
            config_crc,
            nat_id: UNASSIGNED_NAT,
            device_nat: 0,
            identify: false,
            session: None,
            reset_reason: ResetReason::PowerOnReset,
            behavior,
            stats: DeviceStats::default(),
        }
    }

    /// Core for a Tree device behind a Tree extension.
    pub fn new_tree(
        identity: DeviceIdentity,
        crypto: Arc<CryptoContext>,
        behavior: Box<dyn DeviceBehavior>,
        branch: Branch,
    ) -> Self {
        let mut core = Self::new_extension(identity, crypto, behavior);
        core.kind = DeviceKind::Tree;
        core.branch = Some(branch);
        core.nat_id = 0;
        core
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn serial(&self) -> u32 {
        self.identity.serial
    }

    pub fn state(&self) -> LinkState {
        self.lifecycle.state()
    }

    pub fn is_authorized(&self) -> bool {
        self.lifecycle.is_authorized()
    }

    pub fn nat_id(&self) -> u8 {
        self.nat_id
    }

    pub fn device_nat(&self) -> u8 {
        self.device_nat
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn configuration_crc(&self) -> u32 {
        self.config_crc
    }

    /// Whether the visual identify signal is active.
    pub fn is_identifying(&self) -> bool {
        self.identify
    }

    /// Session keys from the last solved challenge, for encrypted data
    /// packets.
    pub fn session(&self) -> Option<&SessionKeys> {
        self.session.as_ref()
    }

    pub fn is_assigned(&self) -> bool {
        match self.kind {
            DeviceKind::Extension => self.nat_id != UNASSIGNED_NAT,
            DeviceKind::Tree => self.device_nat != 0,
        }
    }

    /// Stamp the parent extension's NAT onto a Tree core.
    pub(crate) fn set_parent_nat(&mut self, nat: u8) {
        if self.kind == DeviceKind::Tree {
            self.nat_id = nat;
        }
    }

    /// Force the next offer to `at` (tree offer cascade).
    pub(crate) fn schedule_offer_at(&mut self, at: Instant) {
        self.lifecycle.schedule_offer_at(at);
    }

    /// Whether a routed `device_id` addresses this Tree core.
    pub(crate) fn accepts_device_id(&self, device_id: u8) -> bool {
        if self.device_nat != 0 && device_id == self.device_nat {
            return true;
        }
        // Parked devices answer the parked address range.
        device_id & 0x80 != 0 && self.state() == LinkState::Parked
    }

    /// Reset to Offline and drop the NAT assignment, keeping the serial.
    pub fn reboot(&mut self, now: Instant, reason: ResetReason, cause: &str) {
        info!(serial = format_args!("{:08x}", self.serial()), cause, "device reboot");
        self.reset_reason = reason;
        self.session = None;
        self.update.reset();
        match self.kind {
            DeviceKind::Extension => self.nat_id = UNASSIGNED_NAT,
            DeviceKind::Tree => self.device_nat = 0,
        }
        self.lifecycle.reset(now, cause);
        self.behavior.on_state(LinkState::Offline, cause);
    }

    // --- send primitives -------------------------------------------------

    /// Queue a simple device→server frame with our addressing.
    pub(crate) fn emit(&mut self, out: &mut Outbox, command: Command, data: [u8; 7]) {
        self.stats.tx_frames += 1;
        out.push(Outbound::Frame(NatFrame::reply(
            self.nat_id,
            self.device_nat,
            command,
            data,
        )));
    }

    /// Queue a fragmented device→server payload with our addressing.
    pub(crate) fn emit_fragmented(&mut self, out: &mut Outbox, command: Command, data: Vec<u8>) {
        self.stats.tx_frames += 1;
        out.push(Outbound::Fragmented {
            nat_id: self.nat_id,
            device_id: self.device_nat,
            command: command as u8,
            data,
        });
    }

    /// Keep-alive payload: reason, configuration version, configuration
    /// CRC.
    pub(crate) fn emit_alive(&mut self, out: &mut Outbox) {
        let data = NatFrame::pack(
            ResetReason::AlivePackage as u8,
            self.config.version as u16,
            self.config_crc,
        );
        self.emit(out, Command::Alive, data);
    }

    pub(crate) fn emit_offer(&mut self, out: &mut Outbox) {
        let t = self.identity.device_type.to_le_bytes();
        let s = self.serial().to_le_bytes();
        let data = match self.kind {
            DeviceKind::Extension => [0x00, t[0], t[1], s[0], s[1], s[2], s[3]],
            // Real Tree hardware duplicates the type high byte in front.
            DeviceKind::Tree => [t[1], t[0], t[1], s[0], s[1], s[2], s[3]],
        };
        self.stats.tx_frames += 1;
        out.push(Outbound::Frame(NatFrame::reply(
            self.nat_id,
            0,
            Command::NatOfferRequest,
            data,
        )));
    }

    /// 20-byte info payload shared by `StartInfo` and `VersionInfo`.
    pub(crate) fn info_payload(&self, reason: ResetReason) -> Vec<u8> {
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&self.identity.firmware_version.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&self.config_crc.to_le_bytes());
        data.extend_from_slice(&self.serial().to_le_bytes());
        data.push(reason as u8);
        data.extend_from_slice(&self.identity.device_type.to_le_bytes());
        data.push(self.identity.hardware_version);
        data
    }

    pub(crate) fn emit_start_info(&mut self, out: &mut Outbox) {
        let payload = self.info_payload(self.reset_reason);
        self.emit_fragmented(out, Command::StartInfo, payload);
    }

    /// Emit the `SetOffline` farewell, used by the stop path.
    pub(crate) fn emit_set_offline(&mut self, out: &mut Outbox) {
        self.emit(out, Command::SetOffline, [0u8; 7]);
    }

    // --- timers ----------------------------------------------------------

    /// Advance timers: offers while Offline, keep-alive and the offline
    /// countdown while assigned.
    pub fn tick(&mut self, now: Instant, out: &mut Outbox) {
        for event in self.lifecycle.tick(now) {
            match event {
                LifecycleEvent::EmitOffer => self.emit_offer(out),
                LifecycleEvent::EmitAlive => self.emit_alive(out),
                LifecycleEvent::WentOffline => {
                    match self.kind {
                        DeviceKind::Extension => self.nat_id = UNASSIGNED_NAT,
                        DeviceKind::Tree => self.device_nat = 0,
                    }
                    self.session = None;
                    self.behavior.on_state(LinkState::Offline, "offline timeout");
                }
            }
        }
        if self.state() == LinkState::Online {
            let mut sender = BehaviorSender {
                nat_id: self.nat_id,
                device_nat: self.device_nat,
                sent: 0,
                out,
            };
            self.behavior.poll(&mut sender);
            self.stats.tx_frames += sender.sent;
        }
    }

    /// Sender for the behavior hooks, pre-stamped with our addressing.
    pub(crate) fn behavior_sender<'a>(&self, out: &'a mut Outbox) -> BehaviorSender<'a> {
        BehaviorSender {
            nat_id: self.nat_id,
            device_nat: self.device_nat,
            sent: 0,
            out,
        }
    }
}

/// Narrow send interface handed to device behaviors.
pub struct BehaviorSender<'a> {
    nat_id: u8,
    device_nat: u8,
    pub(crate) sent: u64,
    out: &'a mut Outbox,
}

impl BehaviorSender<'_> {
    pub fn send(&mut self, command: Command, data: [u8; 7]) {
        self.sent += 1;
        self.out.push(Outbound::Frame(NatFrame::reply(
            self.nat_id,
            self.device_nat,
            command,
            data,
        )));
    }

    pub fn send_fragmented(&mut self, command: Command, data: Vec<u8>) {
        self.sent += 1;
        self.out.push(Outbound::Fragmented {
            nat_id: self.nat_id,
            device_id: self.device_nat,
            command: command as u8,
            data,
        });
    }
}

/// A node the runner can drive: one plain extension or a tree router.
pub trait LinkNode: Send {
    /// Process one raw CAN frame.
    fn handle_can(&mut self, now: Instant, frame: &CanFrame, out: &mut Outbox);
    /// Advance timers.
    fn tick(&mut self, now: Instant, out: &mut Outbox);
    /// Emit the farewell frames for a clean stop.
    fn shutdown(&mut self, out: &mut Outbox);
}

/// A single extension on the Link bus (e.g. the digital-input
/// extension).
pub struct Extension {
    core: DeviceCore,
}

impl Extension {
    pub fn new(
        identity: DeviceIdentity,
        crypto: Arc<CryptoContext>,
        behavior: Box<dyn DeviceBehavior>,
    ) -> Self {
        Self {
            core: DeviceCore::new_extension(identity, crypto, behavior),
        }
    }

    pub fn core(&self) -> &DeviceCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }
}

impl LinkNode for Extension {
    fn handle_can(&mut self, now: Instant, frame: &CanFrame, out: &mut Outbox) {
        let Ok(frame) = NatFrame::decode(frame) else {
            return;
        };
        if !frame.from_server {
            return;
        }
        if frame.nat_id != self.core.nat_id && frame.nat_id != BROADCAST_NAT {
            return;
        }
        if frame.device_id != 0 && frame.device_id != BROADCAST_DEVICE {
            return;
        }
        self.core.handle_frame(now, &frame, out);
    }

    fn tick(&mut self, now: Instant, out: &mut Outbox) {
        self.core.tick(now, out);
    }

    fn shutdown(&mut self, out: &mut Outbox) {
        if self.core.state() == LinkState::Online {
            self.core.emit_set_offline(out);
        }
    }
}
