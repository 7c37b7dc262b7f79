use crate::events::{ClientIdentity, ParticipantInfo};

/// Known members of the current room, excluding ourselves.
///
/// Seeded from the relay's roster snapshot and kept current by
/// join/leave events and peer teardown.
#[derive(Debug, Clone, Default)]
pub struct RoomMembership {
    members: Vec<ParticipantInfo>,
    local: Option<ClientIdentity>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local(&mut self, identity: ClientIdentity) {
        self.local = Some(identity);
    }

    pub fn local(&self) -> Option<&ClientIdentity> {
        self.local.as_ref()
    }

    pub fn is_local(&self, id: &str) -> bool {
        self.local.as_ref().is_some_and(|l| l.id == id)
    }

    /// Replace the member list with a roster snapshot. Our own id and
    /// repeated entries are skipped. Returns the entries actually kept.
    pub fn replace_roster(&mut self, roster: Vec<ParticipantInfo>) -> Vec<ParticipantInfo> {
        self.members.clear();
        for info in roster {
            self.add(info);
        }
        self.members.clone()
    }

    /// Returns false when the id is already known or is ourselves.
    pub fn add(&mut self, info: ParticipantInfo) -> bool {
        if self.is_local(&info.id) || self.contains(&info.id) {
            return false;
        }
        self.members.push(info);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<ParticipantInfo> {
        let index = self.members.iter().position(|p| p.id == id)?;
        Some(self.members.remove(index))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|p| p.id == id)
    }

    pub fn members(&self) -> &[ParticipantInfo] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.local = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, name: &str) -> ParticipantInfo {
        ParticipantInfo {
            id: id.to_string(),
            name: Some(name.to_string()),
        }
    }

    #[test]
    fn add_and_retrieve_member() {
        let mut roster = RoomMembership::new();
        assert!(roster.add(member("c2", "Bob")));
        assert_eq!(roster.len(), 1);
        assert!(roster.contains("c2"));
        assert_eq!(roster.members()[0].name.as_deref(), Some("Bob"));
    }

    #[test]
    fn no_duplicate_members() {
        let mut roster = RoomMembership::new();
        assert!(roster.add(member("c2", "Bob")));
        assert!(!roster.add(member("c2", "Bob")));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn local_identity_is_never_a_member() {
        let mut roster = RoomMembership::new();
        roster.set_local(ClientIdentity { id: "c1".into(), name: Some("Alice".into()) });
        let kept = roster.replace_roster(vec![member("c1", "Alice"), member("c2", "Bob"), member("c2", "Bob")]);
        assert_eq!(kept, vec![member("c2", "Bob")]);
        assert!(roster.is_local("c1"));
        assert!(!roster.contains("c1"));
    }

    #[test]
    fn replace_roster_drops_previous_members() {
        let mut roster = RoomMembership::new();
        roster.add(member("old", "Old"));
        roster.replace_roster(vec![member("c2", "Bob")]);
        assert!(!roster.contains("old"));
        assert!(roster.contains("c2"));
    }

    #[test]
    fn remove_member() {
        let mut roster = RoomMembership::new();
        roster.add(member("c2", "Bob"));
        roster.add(member("c3", "Carol"));
        assert_eq!(roster.remove("c2").map(|p| p.id), Some("c2".to_string()));
        assert!(roster.remove("c2").is_none());
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn clear_resets_everything() {
        let mut roster = RoomMembership::new();
        roster.set_local(ClientIdentity { id: "c1".into(), name: None });
        roster.add(member("c2", "Bob"));
        roster.clear();
        assert!(roster.is_empty());
        assert!(roster.local().is_none());
    }
}
