use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::{parse_timestamp, StoreError, StoreResult};

/// Columns a caller may never write through a partial update.
const IMMUTABLE_FIELDS: &[&str] = &[
    "id",
    "unique_id",
    "created_at",
    "updated_at",
    "last_synced_to_index",
    "last_synced_to_mirror",
    "org_unit_name",
];

/// One typed column assignment of a partial update.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldAssignment {
    Title(String),
    Url(Option<String>),
    ImageUrl(Option<String>),
    VideoUrl(Option<String>),
    Category(Option<String>),
    Tags(Vec<String>),
    Body(Option<String>),
    EditorialLead(Option<String>),
    Subtitle(Option<String>),
    Summary(Option<String>),
    PublishedAt(DateTime<Utc>),
    SourceUpdatedAt(Option<DateTime<Utc>>),
    ExtractedAt(Option<DateTime<Utc>>),
    /// Re-point the record to another unit, by key.
    OrgUnit(String),
    TopicL1(Option<String>),
    TopicL2(Option<String>),
    TopicL3(Option<String>),
    MostSpecificTopic(Option<String>),
}

impl FieldAssignment {
    pub fn parse(name: &str, value: &Value) -> StoreResult<Self> {
        if IMMUTABLE_FIELDS.contains(&name) {
            return Err(StoreError::invalid(format!("field {name:?} cannot be updated")));
        }
        let assignment = match name {
            "title" => FieldAssignment::Title(required_text(name, value)?),
            "url" => FieldAssignment::Url(optional_text(name, value)?),
            "image_url" => FieldAssignment::ImageUrl(optional_text(name, value)?),
            "video_url" => FieldAssignment::VideoUrl(optional_text(name, value)?),
            "category" => FieldAssignment::Category(optional_text(name, value)?),
            "tags" => FieldAssignment::Tags(text_list(name, value)?),
            "body" | "content" => FieldAssignment::Body(optional_text(name, value)?),
            "editorial_lead" => FieldAssignment::EditorialLead(optional_text(name, value)?),
            "subtitle" => FieldAssignment::Subtitle(optional_text(name, value)?),
            "summary" => FieldAssignment::Summary(optional_text(name, value)?),
            "published_at" => FieldAssignment::PublishedAt(
                optional_timestamp(name, value)?
                    .ok_or_else(|| StoreError::invalid("published_at cannot be cleared"))?,
            ),
            "source_updated_at" => {
                FieldAssignment::SourceUpdatedAt(optional_timestamp(name, value)?)
            }
            "extracted_at" => FieldAssignment::ExtractedAt(optional_timestamp(name, value)?),
            "org_unit_key" | "org_unit" => FieldAssignment::OrgUnit(required_text(name, value)?),
            "topic_l1" => FieldAssignment::TopicL1(optional_text(name, value)?),
            "topic_l2" => FieldAssignment::TopicL2(optional_text(name, value)?),
            "topic_l3" => FieldAssignment::TopicL3(optional_text(name, value)?),
            "most_specific_topic" => {
                FieldAssignment::MostSpecificTopic(optional_text(name, value)?)
            }
            other => return Err(StoreError::invalid(format!("unknown field {other:?}"))),
        };
        Ok(assignment)
    }

    pub fn column(&self) -> &'static str {
        match self {
            FieldAssignment::Title(_) => "title",
            FieldAssignment::Url(_) => "url",
            FieldAssignment::ImageUrl(_) => "image_url",
            FieldAssignment::VideoUrl(_) => "video_url",
            FieldAssignment::Category(_) => "category",
            FieldAssignment::Tags(_) => "tags",
            FieldAssignment::Body(_) => "body",
            FieldAssignment::EditorialLead(_) => "editorial_lead",
            FieldAssignment::Subtitle(_) => "subtitle",
            FieldAssignment::Summary(_) => "summary",
            FieldAssignment::PublishedAt(_) => "published_at",
            FieldAssignment::SourceUpdatedAt(_) => "source_updated_at",
            FieldAssignment::ExtractedAt(_) => "extracted_at",
            FieldAssignment::OrgUnit(_) => "org_unit_id",
            FieldAssignment::TopicL1(_) => "topic_l1_id",
            FieldAssignment::TopicL2(_) => "topic_l2_id",
            FieldAssignment::TopicL3(_) => "topic_l3_id",
            FieldAssignment::MostSpecificTopic(_) => "most_specific_topic_id",
        }
    }
}

/// Validated, non-empty set of column assignments.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPatch {
    assignments: Vec<FieldAssignment>,
}

impl RecordPatch {
    pub fn new(assignments: Vec<FieldAssignment>) -> StoreResult<Self> {
        if assignments.is_empty() {
            return Err(StoreError::invalid("update requires at least one field"));
        }
        Ok(Self { assignments })
    }

    /// Parse a loosely typed field map, rejecting unknown or immutable names.
    pub fn from_fields(fields: &Map<String, Value>) -> StoreResult<Self> {
        let assignments = fields
            .iter()
            .map(|(name, value)| FieldAssignment::parse(name, value))
            .collect::<StoreResult<Vec<_>>>()?;
        Self::new(assignments)
    }

    pub fn assignments(&self) -> &[FieldAssignment] {
        &self.assignments
    }
}

fn optional_text(name: &str, value: &Value) -> StoreResult<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(wrong_type(name, "string or null", other)),
    }
}

fn required_text(name: &str, value: &Value) -> StoreResult<String> {
    match optional_text(name, value)? {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(StoreError::invalid(format!("field {name:?} cannot be empty"))),
    }
}

fn text_list(name: &str, value: &Value) -> StoreResult<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(wrong_type(name, "array of strings", other)),
            })
            .collect(),
        other => Err(wrong_type(name, "array of strings", other)),
    }
}

fn optional_timestamp(name: &str, value: &Value) -> StoreResult<Option<DateTime<Utc>>> {
    match optional_text(name, value)? {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| StoreError::invalid(format!("field {name:?}: bad timestamp {raw:?}"))),
    }
}

fn wrong_type(name: &str, expected: &str, got: &Value) -> StoreError {
    StoreError::invalid(format!("field {name:?} expects {expected}, got {got}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn empty_patch_is_rejected() {
        let err = RecordPatch::from_fields(&Map::new()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn unknown_and_immutable_fields_are_rejected() {
        for name in ["unique_id", "created_at", "last_synced_to_index", "not_a_column"] {
            let mut map = Map::new();
            map.insert(name.to_string(), json!("x"));
            let err = RecordPatch::from_fields(&map).unwrap_err();
            assert!(matches!(err, StoreError::InvalidArgument(_)), "{name}");
        }
    }

    #[test]
    fn typed_assignments_are_parsed() {
        let patch = RecordPatch::from_fields(&fields(json!({
            "summary": "Resumo",
            "tags": ["a", "b"],
            "topic_l1": "01",
            "extracted_at": "2025-01-15 08:00:00",
        })))
        .unwrap();
        assert_eq!(patch.assignments().len(), 4);
        assert!(patch
            .assignments()
            .contains(&FieldAssignment::TopicL1(Some("01".into()))));
        assert!(patch
            .assignments()
            .contains(&FieldAssignment::Tags(vec!["a".into(), "b".into()])));
    }

    #[test]
    fn wrong_types_are_rejected() {
        assert!(RecordPatch::from_fields(&fields(json!({ "tags": "single" }))).is_err());
        assert!(RecordPatch::from_fields(&fields(json!({ "title": 5 }))).is_err());
        assert!(RecordPatch::from_fields(&fields(json!({ "published_at": null }))).is_err());
        assert!(RecordPatch::from_fields(&fields(json!({ "extracted_at": "yesterday" }))).is_err());
    }
}
