//! Process-local moderation state.
//!
//! One [`ModerationStore`] is built per process and shared by reference with
//! the dispatcher, the history scan and the owner commands. Nothing here is
//! persisted; a restart clears every mute, ban and detector window.

use super::config::ModerationConfig;
use super::timing::{TimingDetector, TimingThresholds};
use super::types::{DetectionStats, LinkViolation, MuteRecord, MutedUserSummary};
use crate::identity::SenderId;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct ModerationState {
    mutes: HashMap<SenderId, MuteRecord>,
    banned: HashSet<SenderId>,
    link_violations: HashMap<SenderId, LinkViolation>,
    bot_suspects: HashSet<SenderId>,
    timing: TimingDetector,
}

/// Mutes, bans, link counters, bot suspects and timing windows
#[derive(Debug)]
pub struct ModerationStore {
    state: Mutex<ModerationState>,
    group_control: AtomicBool,
    failed_deletes: AtomicU64,
}

impl Default for ModerationStore {
    fn default() -> Self {
        Self::new(&ModerationConfig::default())
    }
}

impl ModerationStore {
    /// Create an empty store with group control enabled
    #[must_use]
    pub fn new(config: &ModerationConfig) -> Self {
        Self {
            state: Mutex::new(ModerationState {
                timing: TimingDetector::new(TimingThresholds::from(config)),
                ..ModerationState::default()
            }),
            group_control: AtomicBool::new(true),
            failed_deletes: AtomicU64::new(0),
        }
    }

    /// Whether moderation runs on group traffic
    #[must_use]
    pub fn group_control_enabled(&self) -> bool {
        self.group_control.load(Ordering::Relaxed)
    }

    /// Toggle moderation of group traffic
    pub fn set_group_control(&self, enabled: bool) {
        self.group_control.store(enabled, Ordering::Relaxed);
        info!(enabled, "Group control updated");
    }

    /// Whether `sender` is permanently banned
    #[must_use]
    pub fn is_banned(&self, sender: &SenderId) -> bool {
        self.state.lock().banned.contains(sender)
    }

    /// Add `sender` to the ban set, optionally also as a bot suspect.
    ///
    /// Returns `false` if the sender was already banned.
    pub fn ban(&self, sender: &SenderId, as_bot: bool) -> bool {
        let mut state = self.state.lock();
        if as_bot {
            state.bot_suspects.insert(sender.clone());
        }
        let inserted = state.banned.insert(sender.clone());
        if inserted {
            info!(sender = %sender, as_bot, "🔇 Permanently muted");
        }
        inserted
    }

    /// Lift a ban, clearing link violations and bot suspicion with it.
    ///
    /// Returns `false` and changes nothing if the sender was not banned.
    pub fn unban_user(&self, sender: &SenderId) -> bool {
        let mut state = self.state.lock();
        if !state.banned.remove(sender) {
            return false;
        }
        state.link_violations.remove(sender);
        state.bot_suspects.remove(sender);
        state.timing.forget_sender(sender);
        info!(sender = %sender, "🔓 Unbanned");
        true
    }

    /// Feed the timing detector; `edit_of` marks the event as an edit.
    pub fn check_timing(&self, sender: &SenderId, edit_of: Option<&str>, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        let rapid_messages = state.timing.record_and_check_rapid_messages(sender, now);
        let rapid_edits = edit_of.is_some_and(|id| state.timing.record_and_check_rapid_edits(id, now));
        rapid_messages || rapid_edits
    }

    /// Count a message against an active mute.
    ///
    /// Returns the updated record while the mute is active. An expired mute
    /// is removed and `None` returned.
    pub fn record_muted_message(&self, sender: &SenderId, now: DateTime<Utc>) -> Option<MuteRecord> {
        let mut state = self.state.lock();
        match state.mutes.get_mut(sender) {
            None => return None,
            Some(record) if now < record.muted_until => {
                record.message_count += 1;
                return Some(record.clone());
            }
            Some(_) => {}
        }
        state.mutes.remove(sender);
        info!(sender = %sender, "🔓 Mute expired");
        None
    }

    /// Mute `sender` until `now + duration`.
    ///
    /// An active mute is refreshed: the expiry moves and the message count
    /// grows, the original start time is kept.
    pub fn mute(&self, sender: &SenderId, now: DateTime<Utc>, duration: Duration, char_count: usize) -> MuteRecord {
        let mut state = self.state.lock();
        let muted_until = now + duration;
        let record = state
            .mutes
            .entry(sender.clone())
            .and_modify(|record| {
                if now < record.muted_until {
                    record.message_count += 1;
                } else {
                    record.message_count = 1;
                    record.muted_at = now;
                }
                record.muted_until = muted_until;
                record.spam_char_count = char_count;
            })
            .or_insert_with(|| MuteRecord {
                sender: sender.clone(),
                muted_until,
                message_count: 1,
                muted_at: now,
                spam_char_count: char_count,
            });
        info!(sender = %sender, until = %record.muted_until, "🔇 Muted");
        record.clone()
    }

    /// Mute `sender` only if no active mute exists. Returns whether a mute was created.
    pub fn mute_if_unmuted(&self, sender: &SenderId, now: DateTime<Utc>, duration: Duration, char_count: usize) -> bool {
        {
            let state = self.state.lock();
            if state.mutes.get(sender).is_some_and(|r| now < r.muted_until) {
                return false;
            }
        }
        self.mute(sender, now, duration, char_count);
        true
    }

    /// Current mute record, expired or not
    #[must_use]
    pub fn mute_record(&self, sender: &SenderId) -> Option<MuteRecord> {
        self.state.lock().mutes.get(sender).cloned()
    }

    /// Count one link violation and return the updated counters
    pub fn record_link_violation(&self, sender: &SenderId) -> LinkViolation {
        let mut state = self.state.lock();
        let violation = state.link_violations.entry(sender.clone()).or_default();
        violation.count += 1;
        violation.warnings += 1;
        *violation
    }

    /// Link counters for `sender`
    #[must_use]
    pub fn link_violation(&self, sender: &SenderId) -> Option<LinkViolation> {
        self.state.lock().link_violations.get(sender).copied()
    }

    /// Active mutes; expired entries are evicted on the way
    pub fn muted_users(&self, now: DateTime<Utc>) -> Vec<MutedUserSummary> {
        let mut state = self.state.lock();
        state.mutes.retain(|_, record| now < record.muted_until);
        let mut muted: Vec<_> = state
            .mutes
            .values()
            .map(|record| MutedUserSummary {
                user_id: record.sender.clone(),
                remaining_minutes: record.remaining_minutes(now),
                deleted_messages: record.message_count,
            })
            .collect();
        muted.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        muted
    }

    /// Banned senders, sorted
    #[must_use]
    pub fn banned_users(&self) -> Vec<SenderId> {
        let mut banned: Vec<_> = self.state.lock().banned.iter().cloned().collect();
        banned.sort();
        banned
    }

    /// Senders banned by the timing detector, sorted
    #[must_use]
    pub fn bot_suspects(&self) -> Vec<SenderId> {
        let mut suspects: Vec<_> = self.state.lock().bot_suspects.iter().cloned().collect();
        suspects.sort();
        suspects
    }

    /// Snapshot of detector counters
    #[must_use]
    pub fn detection_stats(&self, now: DateTime<Utc>) -> DetectionStats {
        let state = self.state.lock();
        DetectionStats {
            permanently_muted: state.banned.len(),
            bot_suspects: state.bot_suspects.len(),
            link_violators: state.link_violations.len(),
            temporarily_muted: state.mutes.values().filter(|r| now < r.muted_until).count(),
            tracked_senders: state.timing.tracked_senders(),
            tracked_edits: state.timing.tracked_edits(),
            failed_deletes: self.failed_deletes.load(Ordering::Relaxed),
        }
    }

    /// Count a failed delete and return the running total
    pub fn record_delete_failure(&self) -> u64 {
        let total = self.failed_deletes.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(total, "Delete failure recorded");
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityError;

    fn sender(n: &str) -> Result<SenderId, IdentityError> {
        SenderId::from_address(n)
    }

    #[test]
    fn unban_of_unknown_sender_is_a_no_op() -> Result<(), IdentityError> {
        let store = ModerationStore::default();
        let who = sender("5")?;
        store.record_link_violation(&who);
        assert!(!store.unban_user(&who));
        assert_eq!(store.link_violation(&who).map(|v| v.warnings), Some(1));
        Ok(())
    }

    #[test]
    fn unban_clears_ban_violations_and_suspicion() -> Result<(), IdentityError> {
        let store = ModerationStore::default();
        let who = sender("6")?;
        store.record_link_violation(&who);
        store.ban(&who, true);
        assert!(store.is_banned(&who));
        assert_eq!(store.bot_suspects(), vec![who.clone()]);

        assert!(store.unban_user(&who));
        assert!(!store.is_banned(&who));
        assert!(store.link_violation(&who).is_none());
        assert!(store.bot_suspects().is_empty());
        Ok(())
    }

    #[test]
    fn ban_is_idempotent() -> Result<(), IdentityError> {
        let store = ModerationStore::default();
        let who = sender("7")?;
        assert!(store.ban(&who, false));
        assert!(!store.ban(&who, false));
        assert_eq!(store.banned_users().len(), 1);
        Ok(())
    }

    #[test]
    fn expired_mute_is_evicted_on_access() -> Result<(), IdentityError> {
        let store = ModerationStore::default();
        let who = sender("8")?;
        let now = Utc::now();
        store.mute(&who, now, Duration::minutes(10), 200);

        let during = store.record_muted_message(&who, now + Duration::minutes(1));
        assert_eq!(during.map(|r| r.message_count), Some(2));

        assert!(store
            .record_muted_message(&who, now + Duration::minutes(10))
            .is_none());
        assert!(store.mute_record(&who).is_none());
        Ok(())
    }

    #[test]
    fn refreshing_an_active_mute_counts_messages() -> Result<(), IdentityError> {
        let store = ModerationStore::default();
        let who = sender("9")?;
        let now = Utc::now();
        store.mute(&who, now, Duration::minutes(10), 200);
        let later = now + Duration::minutes(2);
        let record = store.mute(&who, later, Duration::minutes(10), 300);
        assert_eq!(record.message_count, 2);
        assert_eq!(record.muted_at, now);
        assert_eq!(record.muted_until, later + Duration::minutes(10));
        assert!(!store.mute_if_unmuted(&who, later, Duration::minutes(10), 300));
        Ok(())
    }

    #[test]
    fn muted_users_reports_remaining_time() -> Result<(), IdentityError> {
        let store = ModerationStore::default();
        let now = Utc::now();
        store.mute(&sender("2")?, now, Duration::minutes(10), 200);
        store.mute(&sender("1")?, now - Duration::minutes(20), Duration::minutes(10), 200);

        let muted = store.muted_users(now);
        assert_eq!(muted.len(), 1);
        assert_eq!(muted[0].user_id, sender("2")?);
        assert_eq!(muted[0].remaining_minutes, 10);
        assert_eq!(store.detection_stats(now).temporarily_muted, 1);
        Ok(())
    }

    #[test]
    fn group_control_toggles() {
        let store = ModerationStore::default();
        assert!(store.group_control_enabled());
        store.set_group_control(false);
        assert!(!store.group_control_enabled());
    }
}
