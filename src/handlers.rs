//! Command dispatch for the device base.
//!
//! Two dispatch paths keyed by command byte: one for plain frames, one
//! for reassembled fragmented payloads. Handlers are idempotent against
//! retransmissions; the stateful ones are `NatOfferConfirm`,
//! `SendConfig`, the crypto challenge and the firmware session. Errors
//! never escape: everything is logged and recovered here.

use std::time::Instant;

use tracing::{debug, error, warn};

use crate::config::{DeviceConfig, ResetReason};
use crate::crypto::{cbc_decrypt, cbc_encrypt, solve_challenge, CRYPTO_MAGIC};
use crate::device::{DeviceCore, DeviceKind, Outbox};
use crate::firmware::{
    UpdateMessage, SUB_FIRMWARE_CRC, SUB_FIRMWARE_DATA, SUB_VERIFY_AND_RESTART, SUB_VERIFY_UPDATE,
};
use crate::fragment::{FeedOutcome, FragmentedFrame};
use crate::lifecycle::LinkState;
use crate::protocol::{Command, NatFrame};

/// Largest ASCII reply that fits the web-service length byte.
const MAX_WEBSERVICE_REPLY: usize = 253;

impl DeviceCore {
    /// Process one NAT frame addressed to this device.
    pub fn handle_frame(&mut self, now: Instant, frame: &NatFrame, out: &mut Outbox) {
        self.stats.rx_frames += 1;
        self.lifecycle.touch(now);

        if frame.fragmented {
            if !self.is_assigned() {
                return;
            }
            match self.assembler.feed(frame) {
                FeedOutcome::Pending => {}
                FeedOutcome::CrcMismatch => self.stats.fragment_crc_errors += 1,
                FeedOutcome::Complete(message) => self.handle_fragmented(now, &message, out),
            }
            return;
        }

        let Some(command) = frame.command() else {
            self.stats.unknown_commands += 1;
            warn!(command = frame.command, "unhandled NAT command");
            return;
        };

        // Until assigned, a device only reacts to assignment and the
        // rediscovery commands; it emits nothing but offers.
        if !self.is_assigned()
            && !matches!(
                command,
                Command::NatOfferConfirm
                    | Command::IdentifyUnknown
                    | Command::ExtensionsOffline
                    | Command::Identify
            )
        {
            return;
        }

        match command {
            Command::VersionRequest => {
                if frame.val32() == self.serial() {
                    let payload = self.info_payload(ResetReason::Pairing);
                    self.emit_fragmented(out, Command::VersionInfo, payload);
                }
            }
            Command::Ping => self.emit(out, Command::Pong, [0u8; 7]),
            Command::Alive => self.emit_alive(out),
            Command::ExtensionsOffline => self.lifecycle.extensions_offline(now),
            Command::TimeSync => debug!("time sync received"),
            Command::Identify => self.handle_identify(frame),
            Command::IdentifyUnknown => self.lifecycle.resume_offers(),
            Command::SearchDevicesRequest => self.handle_search(out),
            Command::CanDiagnosticsRequest => {
                let branch = frame.b0();
                self.emit(
                    out,
                    Command::CanDiagnosticsReply,
                    [branch, 0, 0, 0, 0, 0, 0],
                );
            }
            Command::CanErrorRequest => self.handle_can_error(frame, out),
            Command::WebServiceRequest => {
                let data = frame.data;
                self.handle_webservice(now, &data, out);
            }
            Command::NatOfferConfirm => self.handle_offer_confirm(now, frame, out),
            other => {
                if self.state() == LinkState::Online {
                    let mut sender = self.behavior_sender(out);
                    let handled = self.behavior.handle_command(frame, &mut sender);
                    let sent = sender.sent;
                    self.stats.tx_frames += sent;
                    if handled {
                        return;
                    }
                }
                self.stats.unknown_commands += 1;
                warn!(command = ?other, "command without a handler");
            }
        }
    }

    /// Process one reassembled fragmented payload.
    pub fn handle_fragmented(&mut self, now: Instant, message: &FragmentedFrame, out: &mut Outbox) {
        match message.command() {
            Some(Command::SendConfig) => self.handle_send_config(now, &message.data, out),
            Some(Command::WebServiceRequest) => self.handle_webservice(now, &message.data, out),
            Some(Command::CryptChallengeRequest) => self.handle_challenge(now, &message.data, out),
            Some(Command::CryptDeviceIdRequest) => self.handle_device_id(&message.data, out),
            Some(Command::FirmwareUpdate) => self.handle_firmware(now, &message.data, out),
            _ => {
                if self.state() == LinkState::Online {
                    let mut sender = self.behavior_sender(out);
                    let handled = self.behavior.handle_fragmented(message, &mut sender);
                    let sent = sender.sent;
                    self.stats.tx_frames += sent;
                    if handled {
                        return;
                    }
                }
                self.stats.unknown_commands += 1;
                warn!(command = message.command, "fragmented command without a handler");
            }
        }
    }

    fn handle_identify(&mut self, frame: &NatFrame) {
        let serial = frame.val32();
        if serial == self.serial() {
            self.identify = true;
            self.behavior.on_identify(true);
        } else if serial == 0 {
            self.identify = false;
            self.behavior.on_identify(false);
        }
    }

    fn handle_search(&mut self, out: &mut Outbox) {
        let tag = self.branch.map_or(0, |b| b.tag());
        let t = self.identity.device_type.to_le_bytes();
        let s = self.serial().to_le_bytes();
        self.emit(
            out,
            Command::SearchDevicesResponse,
            [tag, t[0], t[1], s[0], s[1], s[2], s[3]],
        );
    }

    fn handle_can_error(&mut self, frame: &NatFrame, out: &mut Outbox) {
        let branch = frame.b0();
        // Tree branches report a 0x80 status; the counters stay zeroed
        // because the emulation never sees bus errors.
        let status = if branch != 0 { 0x80 } else { 0x00 };
        self.emit(
            out,
            Command::CanErrorReply,
            [branch, 0x00, status, branch, 0x00, 0x00, 0x00],
        );
    }

    fn handle_offer_confirm(&mut self, now: Instant, frame: &NatFrame, out: &mut Outbox) {
        if frame.val32() != self.serial() {
            // Another device's assignment; the tree router forwards
            // these to the matching child.
            return;
        }
        let assigned = frame.b0();
        let parked = frame.data[1] != 0;
        match self.kind {
            DeviceKind::Extension => self.nat_id = assigned,
            DeviceKind::Tree => self.device_nat = assigned,
        }
        let state = self.lifecycle.confirm(now, parked);
        self.behavior.on_state(state, "nat offer confirmed");
        if state == LinkState::Online {
            self.emit_start_info(out);
        }
    }

    fn handle_send_config(&mut self, now: Instant, record: &[u8], out: &mut Outbox) {
        let config = match DeviceConfig::parse(record) {
            Ok(config) => config,
            Err(e) => {
                // No ConfigEqual; the Miniserver retries.
                warn!(error = %e, "configuration record rejected");
                return;
            }
        };
        self.config_crc = DeviceConfig::record_crc(record);
        self.lifecycle
            .set_offline_timeout(now, config.offline_timeout_secs);
        self.behavior.on_config(&config);
        self.config = config;
        self.emit(out, Command::ConfigEqual, [0u8; 7]);
    }

    // --- web service ------------------------------------------------------

    fn handle_webservice(&mut self, now: Instant, payload: &[u8], out: &mut Outbox) {
        let Some((&len, text)) = payload.split_first() else {
            return;
        };
        let text = &text[..(len as usize).min(text.len())];
        let text = String::from_utf8_lossy(text);
        let verb = text.trim_end_matches('\0').trim();

        let mut reboot = false;
        let reply = if verb.eq_ignore_ascii_case("version") {
            format_version(self.identity.firmware_version)
        } else if verb.eq_ignore_ascii_case("statistics") {
            let s = self.stats;
            format!(
                "Rcv:{};Sent:{};FragCrcErr:{};Unknown:{};",
                s.rx_frames, s.tx_frames, s.fragment_crc_errors, s.unknown_commands
            )
        } else if verb.eq_ignore_ascii_case("techreport") {
            format!(
                "serial:{:08X};type:{:04X};hw:{};fw:{};state:{:?};nat:{:02X};dev:{:02X};",
                self.serial(),
                self.identity.device_type,
                self.identity.hardware_version,
                format_version(self.identity.firmware_version),
                self.state(),
                self.nat_id,
                self.device_nat
            )
        } else if verb.eq_ignore_ascii_case("reboot") {
            reboot = true;
            "Rebooting...".to_string()
        } else if verb.eq_ignore_ascii_case("forceupdate") {
            "Forcing update...".to_string()
        } else {
            format!("Unknown command: {verb}")
        };

        self.reply_webservice(out, &reply);
        if reboot {
            self.reboot(now, ResetReason::SoftwareReset, "webservice reboot");
        }
    }

    fn reply_webservice(&mut self, out: &mut Outbox, text: &str) {
        let text = &text.as_bytes()[..text.len().min(MAX_WEBSERVICE_REPLY)];
        let mut data = Vec::with_capacity(text.len() + 3);
        data.push(0x00);
        data.push(text.len() as u8 + 1);
        data.extend_from_slice(text);
        data.push(0x00);
        self.emit_fragmented(out, Command::WebServiceRequest, data);
    }

    // --- crypto -----------------------------------------------------------

    fn handle_challenge(&mut self, now: Instant, data: &[u8], out: &mut Outbox) {
        let serial = self.serial();
        let (key, iv) = self.crypto.modern_key_iv(serial);
        let mut buf = data.to_vec();
        if buf.len() < 16 || cbc_decrypt(&key, &iv, &mut buf).is_err() {
            error!(
                serial = format_args!("{serial:08x}"),
                "challenge packet failed to decrypt"
            );
            self.lifecycle.deauthorize();
            return;
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != CRYPTO_MAGIC {
            error!(
                serial = format_args!("{serial:08x}"),
                "challenge magic mismatch"
            );
            self.lifecycle.deauthorize();
            return;
        }
        let random = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let session = solve_challenge(&self.identity.stm_id, random, serial);

        let mut reply = Vec::with_capacity(16);
        reply.extend_from_slice(&CRYPTO_MAGIC.to_le_bytes());
        reply.extend_from_slice(&rand::random::<u32>().to_le_bytes());
        reply.extend_from_slice(&[0xA5u8; 8]);
        if cbc_encrypt(&session.data_key(), &session.data_iv(), &mut reply).is_err() {
            return;
        }
        self.session = Some(session);
        self.emit_fragmented(out, Command::CryptChallengeReply, reply);

        if self.lifecycle.authorize(now) {
            self.behavior.on_state(LinkState::Online, "challenge authorized");
            self.emit_start_info(out);
        }
    }

    fn handle_device_id(&mut self, data: &[u8], out: &mut Outbox) {
        let serial = self.serial();
        let (key, iv) = self.crypto.legacy_key_iv(serial);
        let mut buf = data.to_vec();
        let decrypted = buf.len() >= 16 && cbc_decrypt(&key, &iv, &mut buf).is_ok();
        let magic = decrypted
            .then(|| u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
            .unwrap_or(0);
        let random = decrypted
            .then(|| u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]))
            .unwrap_or(0);

        // A bad packet still gets an answer: zeroed header with the
        // random echoed, so the Miniserver can tell us apart from a dead
        // device.
        let mut reply = vec![0u8; 32];
        reply[4..8].copy_from_slice(&random.to_le_bytes());
        if magic == CRYPTO_MAGIC {
            reply[0..4].copy_from_slice(&CRYPTO_MAGIC.to_le_bytes());
            reply[8..20].copy_from_slice(&self.identity.stm_id);
        } else {
            error!(
                serial = format_args!("{serial:08x}"),
                "device-id request failed to decrypt"
            );
        }
        if cbc_encrypt(&key, &iv, &mut reply).is_err() {
            return;
        }
        self.emit_fragmented(out, Command::CryptDeviceIdReply, reply);
    }

    // --- firmware ---------------------------------------------------------

    fn handle_firmware(&mut self, now: Instant, data: &[u8], out: &mut Outbox) {
        let Some(message) = UpdateMessage::parse(data) else {
            warn!("firmware update payload too short");
            return;
        };
        if message.device_type != self.identity.device_type {
            warn!(
                ours = self.identity.device_type,
                theirs = message.device_type,
                "firmware update for a different device type"
            );
            return;
        }

        let mut restart = false;
        match message.sub_command {
            SUB_FIRMWARE_DATA => self.update.data(&message),
            SUB_FIRMWARE_CRC => self.update.page_crc(&message),
            SUB_VERIFY_UPDATE | SUB_VERIFY_AND_RESTART => {
                if let Some(result) = self.update.verify(&message) {
                    if message.sub_command == SUB_VERIFY_UPDATE {
                        self.emit_fragmented(out, Command::FirmwareUpdate, result.reply);
                    }
                    if result.success {
                        self.identity.firmware_version = result.new_version;
                        self.behavior.on_firmware_applied(result.new_version);
                        self.update.reset();
                        restart = message.sub_command == SUB_VERIFY_AND_RESTART;
                    }
                }
            }
            other => warn!(sub_command = other, "unknown firmware sub-command"),
        }

        // Heartbeat after every sub-command, before any restart takes
        // the device offline.
        self.emit_alive(out);
        if restart {
            self.reboot(now, ResetReason::SoftwareReset, "firmware update applied");
        }
    }
}

fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        version / 1_000_000,
        version / 10_000 % 100,
        version / 100 % 100,
        version % 100
    )
}
