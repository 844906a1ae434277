//! Resolved room access for a principal
//!
//! `Unrestricted` is the admin/owner bypass and allows every room. A
//! `Limited` scope with an empty set is a full lock-out, which is distinct
//! from unrestricted by construction — the Go source modelled this with a
//! nil pointer, here the type system carries it.

use std::collections::HashSet;

/// The set of rooms a principal may act on, with the scene-management subset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomScope {
    /// Admin/owner: every room, including scene management
    Unrestricted,
    /// Explicit grants only
    Limited {
        accessible: HashSet<String>,
        scene_manage: HashSet<String>,
    },
}

impl RoomScope {
    pub fn unrestricted() -> Self {
        RoomScope::Unrestricted
    }

    /// An explicit grant set; `scene_manage` should be a subset of
    /// `accessible`
    pub fn limited(
        accessible: impl IntoIterator<Item = String>,
        scene_manage: impl IntoIterator<Item = String>,
    ) -> Self {
        RoomScope::Limited {
            accessible: accessible.into_iter().collect(),
            scene_manage: scene_manage.into_iter().collect(),
        }
    }

    /// A scope that denies every room
    pub fn locked_out() -> Self {
        RoomScope::Limited {
            accessible: HashSet::new(),
            scene_manage: HashSet::new(),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, RoomScope::Unrestricted)
    }

    pub fn can_access_room(&self, room_id: &str) -> bool {
        match self {
            RoomScope::Unrestricted => true,
            RoomScope::Limited { accessible, .. } => accessible.contains(room_id),
        }
    }

    pub fn can_manage_scenes_in_room(&self, room_id: &str) -> bool {
        match self {
            RoomScope::Unrestricted => true,
            RoomScope::Limited { scene_manage, .. } => scene_manage.contains(room_id),
        }
    }

    /// Number of accessible rooms; `None` when unrestricted
    pub fn room_count(&self) -> Option<usize> {
        match self {
            RoomScope::Unrestricted => None,
            RoomScope::Limited { accessible, .. } => Some(accessible.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrestricted_allows_everything() {
        let scope = RoomScope::unrestricted();
        assert!(scope.can_access_room("room-1"));
        assert!(scope.can_access_room("anything"));
        assert!(scope.can_manage_scenes_in_room("room-1"));
        assert_eq!(scope.room_count(), None);
    }

    #[test]
    fn test_empty_scope_is_lockout() {
        let scope = RoomScope::locked_out();
        assert!(!scope.can_access_room("room-1"));
        assert!(!scope.can_manage_scenes_in_room("room-1"));
        assert_eq!(scope.room_count(), Some(0));
        assert!(!scope.is_unrestricted());
    }

    #[test]
    fn test_limited_scope() {
        let scope = RoomScope::limited(
            ["room-a".to_string(), "room-b".to_string()],
            ["room-a".to_string()],
        );

        assert!(scope.can_access_room("room-a"));
        assert!(scope.can_access_room("room-b"));
        assert!(!scope.can_access_room("room-c"));

        assert!(scope.can_manage_scenes_in_room("room-a"));
        assert!(!scope.can_manage_scenes_in_room("room-b"));
        assert!(!scope.can_manage_scenes_in_room("room-c"));
    }
}
