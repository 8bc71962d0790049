use std::collections::{HashMap, HashSet};

use crate::{
    OrganizationalUnit, StoreError, StoreResult, Topic, TopicAssignment, TopicCodes, TopicRef,
    UnitRef,
};

/// Immutable snapshot of the reference tables with key and id lookups for both.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    units_by_key: HashMap<String, OrganizationalUnit>,
    unit_keys_by_id: HashMap<i32, String>,
    topics_by_code: HashMap<String, Topic>,
    topic_codes_by_id: HashMap<i32, String>,
}

impl ReferenceData {
    pub fn new(units: Vec<OrganizationalUnit>, topics: Vec<Topic>) -> Self {
        let mut data = Self::default();
        for unit in units {
            data.unit_keys_by_id.insert(unit.id, unit.key.clone());
            data.units_by_key.insert(unit.key.clone(), unit);
        }
        for topic in topics {
            data.topic_codes_by_id.insert(topic.id, topic.code.clone());
            data.topics_by_code.insert(topic.code.clone(), topic);
        }
        data
    }

    pub fn unit_by_key(&self, key: &str) -> Option<&OrganizationalUnit> {
        self.units_by_key.get(key)
    }

    pub fn unit_by_id(&self, id: i32) -> Option<&OrganizationalUnit> {
        self.unit_keys_by_id
            .get(&id)
            .and_then(|key| self.units_by_key.get(key))
    }

    pub fn topic_by_code(&self, code: &str) -> Option<&Topic> {
        self.topics_by_code.get(code)
    }

    pub fn topic_by_id(&self, id: i32) -> Option<&Topic> {
        self.topic_codes_by_id
            .get(&id)
            .and_then(|code| self.topics_by_code.get(code))
    }

    pub fn unit_count(&self) -> usize {
        self.units_by_key.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics_by_code.len()
    }

    pub fn units(&self) -> impl Iterator<Item = &OrganizationalUnit> {
        self.units_by_key.values()
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics_by_code.values()
    }

    /// Unknown units are a caller error: every record must belong to one.
    pub fn resolve_unit(&self, key: &str) -> StoreResult<UnitRef> {
        self.unit_by_key(key)
            .map(UnitRef::from)
            .ok_or_else(|| StoreError::invalid(format!("unknown organizational unit {key:?}")))
    }

    /// Unknown topic codes resolve to no topic.
    pub fn resolve_topic(&self, code: Option<&str>) -> Option<TopicRef> {
        code.and_then(|c| self.topic_by_code(c)).map(TopicRef::from)
    }

    pub fn topic_ref_by_id(&self, id: Option<i32>) -> Option<TopicRef> {
        id.and_then(|id| self.topic_by_id(id)).map(TopicRef::from)
    }

    pub fn resolve_topics(&self, codes: &TopicCodes) -> TopicAssignment {
        TopicAssignment {
            l1: self.resolve_topic(codes.l1.as_deref()),
            l2: self.resolve_topic(codes.l2.as_deref()),
            l3: self.resolve_topic(codes.l3.as_deref()),
            most_specific: self.resolve_topic(codes.most_specific.as_deref()),
        }
    }
}

/// Check the structural rules of the reference tables before they are written.
///
/// Unit parents must exist and form no cycle. Topics sit on levels 1 to 3 and level 1
/// has no parent. A deeper topic may be parentless; when it names a parent, that parent
/// lives exactly one level above it.
pub fn validate_reference(units: &[OrganizationalUnit], topics: &[Topic]) -> StoreResult<()> {
    let mut unit_parents: HashMap<&str, Option<&str>> = HashMap::new();
    for unit in units {
        if unit.key.trim().is_empty() {
            return Err(StoreError::invalid("organizational unit with empty key"));
        }
        if unit_parents
            .insert(unit.key.as_str(), unit.parent_key.as_deref())
            .is_some()
        {
            return Err(StoreError::invalid(format!("duplicate unit key {:?}", unit.key)));
        }
    }
    for (key, parent) in &unit_parents {
        if let Some(parent) = parent {
            if !unit_parents.contains_key(parent) {
                return Err(StoreError::invalid(format!(
                    "unit {key:?} has unknown parent {parent:?}"
                )));
            }
        }
        let mut seen = HashSet::from([*key]);
        let mut cursor = *parent;
        while let Some(current) = cursor {
            if !seen.insert(current) {
                return Err(StoreError::invalid(format!(
                    "unit hierarchy has a cycle through {key:?}"
                )));
            }
            cursor = unit_parents.get(current).copied().flatten();
        }
    }

    let levels: HashMap<&str, i16> = topics.iter().map(|t| (t.code.as_str(), t.level)).collect();
    if levels.len() != topics.len() {
        return Err(StoreError::invalid("duplicate topic code"));
    }
    for topic in topics {
        if !(1..=3).contains(&topic.level) {
            return Err(StoreError::invalid(format!(
                "topic {:?} has level {} outside 1..=3",
                topic.code, topic.level
            )));
        }
        match (&topic.parent_code, topic.level) {
            (None, 1) => {}
            (Some(_), 1) => {
                return Err(StoreError::invalid(format!(
                    "level-1 topic {:?} cannot have a parent",
                    topic.code
                )))
            }
            (None, _) => {}
            (Some(parent), level) => match levels.get(parent.as_str()) {
                Some(parent_level) if *parent_level == level - 1 => {}
                Some(_) => {
                    return Err(StoreError::invalid(format!(
                        "topic {:?} is not one level below its parent {parent:?}",
                        topic.code
                    )))
                }
                None => {
                    return Err(StoreError::invalid(format!(
                        "topic {:?} has unknown parent {parent:?}",
                        topic.code
                    )))
                }
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: i32, key: &str, parent: Option<&str>) -> OrganizationalUnit {
        OrganizationalUnit {
            id,
            key: key.into(),
            name: key.to_uppercase(),
            unit_type: Some("ministerio".into()),
            parent_key: parent.map(Into::into),
        }
    }

    fn topic(id: i32, code: &str, level: i16, parent: Option<&str>) -> Topic {
        Topic {
            id,
            code: code.into(),
            label: format!("Topic {code}"),
            level,
            parent_code: parent.map(Into::into),
        }
    }

    #[test]
    fn lookups_agree_by_key_and_id() {
        let data = ReferenceData::new(
            vec![unit(1, "mec", None), unit(2, "inep", Some("mec"))],
            vec![topic(10, "01", 1, None), topic(11, "01.01", 2, Some("01"))],
        );
        assert_eq!(data.unit_by_id(2).map(|u| u.key.as_str()), Some("inep"));
        assert_eq!(data.topic_by_id(11).map(|t| t.code.as_str()), Some("01.01"));
        assert!(data.resolve_unit("nope").is_err());
        assert_eq!(data.resolve_topic(Some("99")), None);
    }

    #[test]
    fn unit_cycles_are_rejected() {
        let units = vec![unit(1, "a", Some("b")), unit(2, "b", Some("a"))];
        assert!(validate_reference(&units, &[]).is_err());
        let units = vec![unit(1, "a", Some("missing"))];
        assert!(validate_reference(&units, &[]).is_err());
    }

    #[test]
    fn topic_levels_follow_parents() {
        let ok = vec![
            topic(1, "01", 1, None),
            topic(2, "01.01", 2, Some("01")),
            topic(3, "01.01.01", 3, Some("01.01")),
        ];
        assert!(validate_reference(&[], &ok).is_ok());

        let skipped_level = vec![topic(1, "01", 1, None), topic(2, "01.01.01", 3, Some("01"))];
        assert!(validate_reference(&[], &skipped_level).is_err());

        let parentless_child = vec![topic(1, "01.07", 2, None), topic(2, "01.07.01", 3, None)];
        assert!(validate_reference(&[], &parentless_child).is_ok());

        let parented_root = vec![topic(1, "01", 1, None), topic(2, "02", 1, Some("01"))];
        assert!(validate_reference(&[], &parented_root).is_err());
    }
}
