//! Room membership — who a Sender Keys group currently fans out to.
//!
//! Unlike the teacher's signed/epoched `GroupState`, membership here carries
//! no admin roles or policy fields: `GroupService` only needs to know who to
//! distribute (and rotate away from) a sender key. Membership changes are
//! driven by the embedding application, not negotiated inside this engine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMembership {
    pub room_id: String,
    pub member_ids: Vec<String>,
}

impl RoomMembership {
    pub fn new(room_id: impl Into<String>, member_ids: Vec<String>) -> Self {
        Self {
            room_id: room_id.into(),
            member_ids,
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.member_ids.iter().any(|m| m == user_id)
    }

    pub fn without(&self, user_id: &str) -> Vec<String> {
        self.member_ids.iter().filter(|m| m.as_str() != user_id).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_removes_member() {
        let m = RoomMembership::new("room-1", vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(m.without("b"), vec!["a".to_string(), "c".to_string()]);
        assert!(m.contains("a"));
        assert!(!m.contains("z"));
    }
}
