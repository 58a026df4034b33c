//! Per-device lifecycle: Offline → Parked → Online, offer backoff and
//! the keep-alive/offline-timeout bookkeeping.
//!
//! The state machine is driven entirely by explicit instants so the
//! device task (and the tests) control time. `tick` reports what the
//! device should do now; the device base turns the events into frames.

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::config::DEFAULT_OFFLINE_TIMEOUT_SECS;

/// Lifecycle states of a NAT device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not assigned; emitting offers on the backoff schedule.
    Offline,
    /// Assigned but not authorised; lifecycle commands only.
    Parked,
    /// Assigned and fully operational.
    Online,
}

/// Actions the device should take, produced by [`Lifecycle::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Emit a `NatOfferRequest`.
    EmitOffer,
    /// Emit a keep-alive `Alive` frame.
    EmitAlive,
    /// The offline timeout elapsed; the device dropped to Offline.
    WentOffline,
}

/// Offer backoff tier for the given number of offers already sent.
pub fn offer_backoff_ms(sent: u32) -> RangeInclusive<u64> {
    match sent {
        0..=2 => 100..=150,
        3..=9 => 500..=1000,
        _ => 2000..=3000,
    }
}

pub struct Lifecycle {
    state: LinkState,
    is_authorized: bool,
    /// Set on `ExtensionsOffline`; suppresses offers until the next
    /// `IdentifyUnknown`.
    offers_suppressed: bool,
    offer_count: u32,
    /// `None` means an offer is due immediately.
    next_offer_at: Option<Instant>,
    offline_deadline: Option<Instant>,
    next_alive_at: Option<Instant>,
    offline_timeout: Duration,
    alive_interval: Duration,
    rng: StdRng,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let mut lifecycle = Self {
            state: LinkState::Offline,
            is_authorized: false,
            offers_suppressed: false,
            offer_count: 0,
            next_offer_at: None,
            offline_deadline: None,
            next_alive_at: None,
            offline_timeout: Duration::from_secs(DEFAULT_OFFLINE_TIMEOUT_SECS as u64),
            alive_interval: Duration::ZERO,
            rng: StdRng::from_entropy(),
        };
        lifecycle.update_alive_interval();
        lifecycle
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_authorized(&self) -> bool {
        self.is_authorized
    }

    /// Apply the offline timeout from a received configuration.
    pub fn set_offline_timeout(&mut self, now: Instant, secs: u32) {
        self.offline_timeout = Duration::from_secs(secs.max(1) as u64);
        self.update_alive_interval();
        if self.state != LinkState::Offline {
            self.offline_deadline = Some(now + self.offline_timeout);
            self.next_alive_at = Some(now + self.alive_interval);
        }
    }

    fn update_alive_interval(&mut self) {
        self.alive_interval = Duration::from_secs(self.offline_timeout.as_secs().max(60));
    }

    /// A frame addressed to this device arrived; push the offline
    /// deadline out.
    pub fn touch(&mut self, now: Instant) {
        if self.state != LinkState::Offline {
            self.offline_deadline = Some(now + self.offline_timeout);
        }
    }

    /// `NatOfferConfirm` for our serial.
    pub fn confirm(&mut self, now: Instant, parked: bool) -> LinkState {
        let target = if parked { LinkState::Parked } else { LinkState::Online };
        self.transition(now, target, "nat offer confirmed");
        target
    }

    /// The challenge was solved; Parked devices go Online.
    /// Returns `true` when that transition happened.
    pub fn authorize(&mut self, now: Instant) -> bool {
        self.is_authorized = true;
        if self.state == LinkState::Parked {
            self.transition(now, LinkState::Online, "challenge authorized");
            return true;
        }
        false
    }

    /// Drop the authorization without touching the state, used when a
    /// challenge fails to decrypt.
    pub fn deauthorize(&mut self) {
        self.is_authorized = false;
    }

    /// `ExtensionsOffline`: keep the current state but drop the
    /// authorization and restart offer timing.
    pub fn extensions_offline(&mut self, now: Instant) {
        self.is_authorized = false;
        self.offers_suppressed = true;
        self.offer_count = 0;
        self.next_offer_at = Some(now);
    }

    /// `IdentifyUnknown`: offers may flow again.
    pub fn resume_offers(&mut self) {
        self.offers_suppressed = false;
        self.offer_count = 0;
        self.next_offer_at = None;
    }

    /// Force the next offer to a specific instant (tree offer cascade).
    pub fn schedule_offer_at(&mut self, at: Instant) {
        self.offers_suppressed = false;
        self.offer_count = 0;
        self.next_offer_at = Some(at);
    }

    /// Reset to Offline (power-on, reboot, stop).
    pub fn reset(&mut self, now: Instant, reason: &str) {
        self.is_authorized = false;
        self.transition(now, LinkState::Offline, reason);
    }

    fn transition(&mut self, now: Instant, to: LinkState, reason: &str) {
        if self.state != to {
            info!(from = ?self.state, ?to, reason, "lifecycle transition");
        }
        self.state = to;
        match to {
            LinkState::Offline => {
                self.offer_count = 0;
                self.next_offer_at = None;
                self.offline_deadline = None;
                self.next_alive_at = None;
            }
            LinkState::Parked | LinkState::Online => {
                self.offer_count = 0;
                self.offline_deadline = Some(now + self.offline_timeout);
                self.next_alive_at = Some(now + self.alive_interval);
            }
        }
    }

    /// Advance time and report the due actions.
    pub fn tick(&mut self, now: Instant) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        match self.state {
            LinkState::Offline => {
                if self.offers_suppressed {
                    return events;
                }
                let due = self.next_offer_at.map_or(true, |at| at <= now);
                if due {
                    events.push(LifecycleEvent::EmitOffer);
                    self.offer_count += 1;
                    let range = offer_backoff_ms(self.offer_count);
                    let delay = Duration::from_millis(self.rng.gen_range(range));
                    self.next_offer_at = Some(now + delay);
                }
            }
            LinkState::Parked | LinkState::Online => {
                if self.offline_deadline.is_some_and(|d| d <= now) {
                    self.reset(now, "offline timeout");
                    events.push(LifecycleEvent::WentOffline);
                } else if self.next_alive_at.is_some_and(|at| at <= now) {
                    events.push(LifecycleEvent::EmitAlive);
                    self.next_alive_at = Some(now + self.alive_interval);
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_tiers_are_exact() {
        assert_eq!(offer_backoff_ms(0), 100..=150);
        assert_eq!(offer_backoff_ms(2), 100..=150);
        assert_eq!(offer_backoff_ms(3), 500..=1000);
        assert_eq!(offer_backoff_ms(9), 500..=1000);
        assert_eq!(offer_backoff_ms(10), 2000..=3000);
        assert_eq!(offer_backoff_ms(100), 2000..=3000);
    }

    #[test]
    fn first_offer_is_immediate() {
        let mut lifecycle = Lifecycle::new();
        let now = Instant::now();
        assert_eq!(lifecycle.tick(now), vec![LifecycleEvent::EmitOffer]);
        // The follow-up honours the first backoff tier.
        assert_eq!(lifecycle.tick(now + Duration::from_millis(50)), vec![]);
        assert_eq!(
            lifecycle.tick(now + Duration::from_millis(151)),
            vec![LifecycleEvent::EmitOffer]
        );
    }

    #[test]
    fn offline_timeout_drops_the_device() {
        let mut lifecycle = Lifecycle::new();
        let now = Instant::now();
        lifecycle.set_offline_timeout(now, 5);
        assert_eq!(lifecycle.confirm(now, false), LinkState::Online);
        // Traffic keeps it alive.
        lifecycle.touch(now + Duration::from_secs(4));
        assert_eq!(lifecycle.tick(now + Duration::from_secs(5)), vec![]);
        // Silence does not.
        assert_eq!(
            lifecycle.tick(now + Duration::from_secs(10)),
            vec![LifecycleEvent::WentOffline]
        );
        assert_eq!(lifecycle.state(), LinkState::Offline);
    }

    #[test]
    fn extensions_offline_keeps_state_and_clears_authorization() {
        let mut lifecycle = Lifecycle::new();
        let now = Instant::now();
        lifecycle.confirm(now, true);
        lifecycle.authorize(now);
        assert_eq!(lifecycle.state(), LinkState::Online);

        lifecycle.extensions_offline(now);
        assert_eq!(lifecycle.state(), LinkState::Online);
        assert!(!lifecycle.is_authorized());
    }

    #[test]
    fn suppressed_offers_resume_on_identify_unknown() {
        let mut lifecycle = Lifecycle::new();
        let now = Instant::now();
        lifecycle.extensions_offline(now);
        assert_eq!(lifecycle.tick(now), vec![]);
        lifecycle.resume_offers();
        assert_eq!(lifecycle.tick(now), vec![LifecycleEvent::EmitOffer]);
    }
}
