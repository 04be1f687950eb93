/// Room registry domain model
///
/// Tracks which members belong to which room. A room exists only while it
/// has at least one member.
use crate::domain::shared::value_objects::{MemberId, RoomId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A named group of members eligible to signal one another
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    /// Members in join order
    members: Vec<MemberId>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            members: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Result of a join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Members that were already in the room, in join order
    pub existing: Vec<MemberId>,
    /// False when the member was already in the room
    pub newly_joined: bool,
}

/// Result of removing a member from one room
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The member was not in the room (or the room does not exist)
    NotMember,
    /// The member left; these members remain and must be told
    Left { remaining: Vec<MemberId> },
    /// The member was the last one; the room was deleted
    RoomClosed,
}

/// In-memory room registry
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member to a room, creating the room if absent
    pub fn join(&mut self, room_id: &RoomId, member: &MemberId) -> JoinOutcome {
        let room = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Room::new(room_id.clone()));

        let existing: Vec<MemberId> = room
            .members
            .iter()
            .filter(|m| *m != member)
            .cloned()
            .collect();

        let newly_joined = !room.contains(member);
        if newly_joined {
            room.members.push(member.clone());
        }

        JoinOutcome {
            existing,
            newly_joined,
        }
    }

    /// Remove a member from one room
    pub fn leave(&mut self, room_id: &RoomId, member: &MemberId) -> LeaveOutcome {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return LeaveOutcome::NotMember;
        };

        let Some(pos) = room.members.iter().position(|m| m == member) else {
            return LeaveOutcome::NotMember;
        };
        room.members.remove(pos);

        if room.is_empty() {
            self.rooms.remove(room_id);
            LeaveOutcome::RoomClosed
        } else {
            LeaveOutcome::Left {
                remaining: room.members.clone(),
            }
        }
    }

    /// Remove a member from every room it belongs to
    pub fn remove_member(&mut self, member: &MemberId) -> Vec<(RoomId, LeaveOutcome)> {
        let mut room_ids: Vec<RoomId> = self
            .rooms
            .values()
            .filter(|room| room.contains(member))
            .map(|room| room.id.clone())
            .collect();
        room_ids.sort();

        room_ids
            .into_iter()
            .map(|room_id| {
                let outcome = self.leave(&room_id, member);
                (room_id, outcome)
            })
            .collect()
    }

    pub fn get(&self, room_id: &RoomId) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Rooms the member currently belongs to
    pub fn rooms_of(&self, member: &MemberId) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self
            .rooms
            .values()
            .filter(|room| room.contains(member))
            .map(|room| room.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    #[test]
    fn test_first_join_creates_room() {
        let mut registry = RoomRegistry::new();
        let a = MemberId::from("a");

        let outcome = registry.join(&room("abc123"), &a);

        assert!(outcome.existing.is_empty());
        assert!(outcome.newly_joined);
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.get(&room("abc123")).unwrap().len(), 1);
    }

    #[test]
    fn test_join_returns_existing_members_in_order() {
        let mut registry = RoomRegistry::new();
        let (a, b, c) = (MemberId::from("a"), MemberId::from("b"), MemberId::from("c"));

        registry.join(&room("r"), &a);
        registry.join(&room("r"), &b);
        let outcome = registry.join(&room("r"), &c);

        assert_eq!(outcome.existing, vec![a, b]);
    }

    #[test]
    fn test_duplicate_join_is_idempotent() {
        let mut registry = RoomRegistry::new();
        let (a, b) = (MemberId::from("a"), MemberId::from("b"));

        registry.join(&room("r"), &a);
        registry.join(&room("r"), &b);
        let outcome = registry.join(&room("r"), &b);

        assert!(!outcome.newly_joined);
        assert_eq!(outcome.existing, vec![a]);
        assert_eq!(registry.get(&room("r")).unwrap().len(), 2);
    }

    #[test]
    fn test_last_leave_deletes_room() {
        let mut registry = RoomRegistry::new();
        let (a, b) = (MemberId::from("a"), MemberId::from("b"));
        registry.join(&room("r"), &a);
        registry.join(&room("r"), &b);

        assert_eq!(
            registry.leave(&room("r"), &a),
            LeaveOutcome::Left {
                remaining: vec![b.clone()]
            }
        );
        assert_eq!(registry.leave(&room("r"), &b), LeaveOutcome::RoomClosed);
        assert_eq!(registry.room_count(), 0);
        assert!(registry.get(&room("r")).is_none());
    }

    #[test]
    fn test_leave_unknown_member_is_noop() {
        let mut registry = RoomRegistry::new();
        registry.join(&room("r"), &MemberId::from("a"));

        assert_eq!(
            registry.leave(&room("r"), &MemberId::from("x")),
            LeaveOutcome::NotMember
        );
        assert_eq!(
            registry.leave(&room("missing"), &MemberId::from("a")),
            LeaveOutcome::NotMember
        );
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn test_remove_member_from_all_rooms() {
        let mut registry = RoomRegistry::new();
        let (a, b) = (MemberId::from("a"), MemberId::from("b"));
        registry.join(&room("one"), &a);
        registry.join(&room("two"), &a);
        registry.join(&room("two"), &b);

        let outcomes = registry.remove_member(&a);

        assert_eq!(
            outcomes,
            vec![
                (room("one"), LeaveOutcome::RoomClosed),
                (room("two"), LeaveOutcome::Left { remaining: vec![b.clone()] }),
            ]
        );
        assert_eq!(registry.room_count(), 1);
        assert!(registry.rooms_of(&a).is_empty());
        assert_eq!(registry.rooms_of(&b), vec![room("two")]);
    }

    #[test]
    fn test_membership_count_tracks_joins_and_leaves() {
        let mut registry = RoomRegistry::new();
        let members: Vec<MemberId> = (0..5).map(|i| MemberId::from(format!("m{i}"))).collect();

        for m in &members {
            registry.join(&room("r"), m);
        }
        registry.leave(&room("r"), &members[1]);
        registry.remove_member(&members[3]);

        assert_eq!(registry.get(&room("r")).unwrap().len(), 3);

        for m in [&members[0], &members[2], &members[4]] {
            registry.leave(&room("r"), m);
        }
        assert_eq!(registry.room_count(), 0);
    }
}
