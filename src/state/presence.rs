use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Liveness of one team device, kept in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub team_id: Uuid,
    pub device_id: Option<String>,
    /// Monotonic instant of the last heartbeat, used for timeouts.
    pub last_heartbeat: Instant,
    /// Server timestamp (milliseconds) of the last heartbeat.
    pub last_heartbeat_at: u64,
    /// Timestamp reported by the device in its last heartbeat.
    pub client_last_seen_at: Option<u64>,
    pub online: bool,
}

/// Outcome of a device claim on a team slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The slot was free and is now bound to the device.
    Claimed,
    /// The device already owned the slot.
    AlreadyOwned,
}

/// Errors raised by presence bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    /// Another device is bound to the team.
    #[error("team `{team_id}` is already connected elsewhere")]
    DeviceConflict {
        team_id: Uuid,
        /// Device currently holding the slot.
        bound_device: String,
    },
    /// The team is bound and the sender did not say which device it is.
    #[error("team `{team_id}` is bound to a device; the sender must identify itself")]
    DeviceRequired { team_id: Uuid },
}

/// Who issued a team action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor<'a> {
    /// The operator, acting on behalf of the team.
    Operator,
    /// A team device, with the identifier it sent, if any.
    Device(Option<&'a str>),
}

/// Check that `actor` may act for a team whose slot is bound to `binding`.
///
/// Unbound teams accept any device.
pub fn authorize(team_id: Uuid, binding: Option<&str>, actor: Actor<'_>) -> Result<(), PresenceError> {
    match (actor, binding) {
        (Actor::Operator, _) | (Actor::Device(_), None) => Ok(()),
        (Actor::Device(Some(device)), Some(bound)) if device == bound => Ok(()),
        (Actor::Device(None), Some(_)) => Err(PresenceError::DeviceRequired { team_id }),
        (Actor::Device(Some(_)), Some(bound)) => Err(PresenceError::DeviceConflict {
            team_id,
            bound_device: bound.to_owned(),
        }),
    }
}

/// Check whether `device_id` may take a slot currently bound to `binding`.
pub fn claim(team_id: Uuid, binding: Option<&str>, device_id: &str) -> Result<Claim, PresenceError> {
    match binding {
        None => Ok(Claim::Claimed),
        Some(bound) if bound == device_id => Ok(Claim::AlreadyOwned),
        Some(bound) => Err(PresenceError::DeviceConflict {
            team_id,
            bound_device: bound.to_owned(),
        }),
    }
}

/// Change detected by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub team_id: Uuid,
    pub online: bool,
}

/// Heartbeat registry shared by the presence channel listener and the sweeper.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: DashMap<Uuid, PresenceRecord>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh a team's record, returning `true` when it just came online.
    pub fn heartbeat(
        &self,
        team_id: Uuid,
        device_id: Option<String>,
        client_last_seen_at: Option<u64>,
        now: Instant,
        server_ms: u64,
    ) -> bool {
        let mut entry = self.records.entry(team_id).or_insert_with(|| PresenceRecord {
            team_id,
            device_id: None,
            last_heartbeat: now,
            last_heartbeat_at: server_ms,
            client_last_seen_at: None,
            online: false,
        });
        let record = entry.value_mut();
        let came_online = !record.online;
        record.last_heartbeat = now;
        record.last_heartbeat_at = server_ms;
        record.online = true;
        if client_last_seen_at.is_some() {
            record.client_last_seen_at = client_last_seen_at;
        }
        if device_id.is_some() {
            record.device_id = device_id;
        }
        came_online
    }

    /// Mark every team silent for longer than `timeout` as offline.
    pub fn sweep(&self, now: Instant, timeout: Duration) -> Vec<PresenceChange> {
        let mut changes = Vec::new();
        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            if record.online && now.saturating_duration_since(record.last_heartbeat) > timeout {
                record.online = false;
                changes.push(PresenceChange {
                    team_id: record.team_id,
                    online: false,
                });
            }
        }
        changes
    }

    /// Teams whose last heartbeat is older than `idle`, whatever their online flag.
    pub fn idle_since(&self, now: Instant, idle: Duration) -> Vec<Uuid> {
        self.records
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_heartbeat) > idle)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Whether a team's last heartbeat is older than `idle`.
    pub fn is_idle(&self, team_id: Uuid, now: Instant, idle: Duration) -> bool {
        self.records
            .get(&team_id)
            .is_none_or(|entry| now.saturating_duration_since(entry.last_heartbeat) > idle)
    }

    /// Forget a team unless it sent a heartbeat within `idle`.
    pub fn remove_if_idle(&self, team_id: Uuid, now: Instant, idle: Duration) -> Option<PresenceRecord> {
        self.records
            .remove_if(&team_id, |_, record| {
                now.saturating_duration_since(record.last_heartbeat) > idle
            })
            .map(|(_, record)| record)
    }

    /// Current record for a team.
    pub fn get(&self, team_id: Uuid) -> Option<PresenceRecord> {
        self.records.get(&team_id).map(|entry| entry.value().clone())
    }

    /// Whether the team is currently considered online.
    pub fn is_online(&self, team_id: Uuid) -> bool {
        self.records
            .get(&team_id)
            .is_some_and(|entry| entry.online)
    }

    /// Mark a team offline immediately, returning `true` when it was online.
    pub fn mark_offline(&self, team_id: Uuid) -> bool {
        match self.records.get_mut(&team_id) {
            Some(mut entry) => std::mem::replace(&mut entry.online, false),
            None => false,
        }
    }

    /// Forget a team entirely.
    pub fn remove(&self, team_id: Uuid) -> Option<PresenceRecord> {
        self.records.remove(&team_id).map(|(_, record)| record)
    }

    /// Forget every team.
    pub fn clear(&self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_accepts_free_slot_and_same_device_only() {
        let team = Uuid::new_v4();
        assert_eq!(claim(team, None, "tablet-a"), Ok(Claim::Claimed));
        assert_eq!(claim(team, Some("tablet-a"), "tablet-a"), Ok(Claim::AlreadyOwned));
        assert_eq!(
            claim(team, Some("tablet-a"), "tablet-b"),
            Err(PresenceError::DeviceConflict {
                team_id: team,
                bound_device: "tablet-a".into()
            })
        );
    }

    #[test]
    fn only_the_bound_device_acts_for_a_bound_team() {
        let team = Uuid::new_v4();
        assert_eq!(authorize(team, None, Actor::Device(None)), Ok(()));
        assert_eq!(authorize(team, Some("tablet-a"), Actor::Operator), Ok(()));
        assert_eq!(authorize(team, Some("tablet-a"), Actor::Device(Some("tablet-a"))), Ok(()));
        assert_eq!(
            authorize(team, Some("tablet-a"), Actor::Device(None)),
            Err(PresenceError::DeviceRequired { team_id: team })
        );
        assert!(matches!(
            authorize(team, Some("tablet-a"), Actor::Device(Some("tablet-b"))),
            Err(PresenceError::DeviceConflict { .. })
        ));
    }

    #[test]
    fn heartbeat_reports_transition_to_online_once() {
        let tracker = PresenceTracker::new();
        let team = Uuid::new_v4();
        let now = Instant::now();
        assert!(tracker.heartbeat(team, Some("dev".into()), Some(42), now, 1_000));
        assert!(!tracker.heartbeat(team, None, None, now + Duration::from_secs(1), 2_000));

        let record = tracker.get(team).unwrap();
        assert_eq!(record.device_id.as_deref(), Some("dev"));
        assert_eq!(record.client_last_seen_at, Some(42));
        assert_eq!(record.last_heartbeat_at, 2_000);
        assert!(record.online);
    }

    #[test]
    fn sweep_marks_silent_teams_offline() {
        let tracker = PresenceTracker::new();
        let quiet = Uuid::new_v4();
        let chatty = Uuid::new_v4();
        let t0 = Instant::now();
        tracker.heartbeat(quiet, None, None, t0, 0);
        tracker.heartbeat(chatty, None, None, t0 + Duration::from_secs(9), 9_000);

        let changes = tracker.sweep(t0 + Duration::from_secs(11), Duration::from_secs(10));
        assert_eq!(
            changes,
            vec![PresenceChange {
                team_id: quiet,
                online: false
            }]
        );
        assert!(!tracker.is_online(quiet));
        assert!(tracker.is_online(chatty));

        // A second sweep does not report the same team again.
        assert!(tracker.sweep(t0 + Duration::from_secs(12), Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn idle_teams_are_listed() {
        let tracker = PresenceTracker::new();
        let team = Uuid::new_v4();
        let t0 = Instant::now();
        tracker.heartbeat(team, None, None, t0, 0);
        assert!(tracker.idle_since(t0 + Duration::from_secs(5), Duration::from_secs(60)).is_empty());
        assert_eq!(
            tracker.idle_since(t0 + Duration::from_secs(61), Duration::from_secs(60)),
            vec![team]
        );

        tracker.heartbeat(team, None, None, t0 + Duration::from_secs(61), 61_000);
        assert!(!tracker.is_idle(team, t0 + Duration::from_secs(61), Duration::from_secs(60)));
        assert!(
            tracker
                .remove_if_idle(team, t0 + Duration::from_secs(61), Duration::from_secs(60))
                .is_none()
        );
        assert!(tracker.get(team).is_some());
    }
}
