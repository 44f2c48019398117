//! Handle types for the map arenas.

/// Handle to a KeyFrame in the map.
///
/// Ids are assigned sequentially and never reused, so a stale handle can
/// only miss (fallible lookup), never alias a different keyframe. This
/// replaces raw cross-pointers between keyframes and map points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameId(pub u64);

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Handle to a MapPoint in the map. Same allocation discipline as
/// [`KeyFrameId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapPointId(pub u64);

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_ids_as_map_keys() {
        let mut m: HashMap<KeyFrameId, &str> = HashMap::new();
        m.insert(KeyFrameId(1), "one");
        assert_eq!(m.get(&KeyFrameId(1)), Some(&"one"));
        assert_eq!(m.get(&KeyFrameId(2)), None);
    }

    #[test]
    fn test_id_ordering() {
        assert!(KeyFrameId(3) < KeyFrameId(10));
        assert!(MapPointId(0) < MapPointId(1));
    }
}
