//! Static light-group registry.
//!
//! Loaded once from `lightGroups` in the config and never mutated. Group
//! iteration and each group's device list keep the order of the config file.

use indexmap::IndexMap;

use crate::error::DispatchError;

#[derive(Debug, Clone, Default)]
pub struct GroupRegistry {
    groups: IndexMap<String, Vec<String>>,
}

impl GroupRegistry {
    pub fn new(groups: IndexMap<String, Vec<String>>) -> Self {
        Self { groups }
    }

    /// Device ids of a group, in configured order.
    pub fn resolve(&self, group_id: &str) -> Result<&[String], DispatchError> {
        self.groups
            .get(group_id)
            .map(Vec::as_slice)
            .ok_or_else(|| DispatchError::UnknownGroup(group_id.to_string()))
    }

    pub fn groups(&self) -> &IndexMap<String, Vec<String>> {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> GroupRegistry {
        let mut groups = IndexMap::new();
        groups.insert("1".to_string(), vec!["uuidA".to_string(), "uuidB".to_string()]);
        groups.insert("hall".to_string(), vec!["uuidC".to_string()]);
        GroupRegistry::new(groups)
    }

    #[test]
    fn resolves_in_device_order() {
        assert_eq!(registry().resolve("1").unwrap(), ["uuidA", "uuidB"]);
    }

    #[test]
    fn unknown_group_is_an_error() {
        let err = registry().resolve("99").unwrap_err();
        assert!(matches!(err, DispatchError::UnknownGroup(ref g) if g == "99"));
    }

    #[test]
    fn group_ids_are_case_sensitive() {
        assert!(registry().resolve("Hall").is_err());
        assert_eq!(registry().len(), 2);
    }
}
