//! Core domain model for Salesmap history records and derived attribution facts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "smap-core";

/// CRM entity whose field-change history can be listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Organization,
    People,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Organization, EntityKind::People];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organization",
            EntityKind::People => "people",
        }
    }

    /// Key of the record array inside the upstream `data` object.
    pub fn list_key(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organizationHistoryList",
            EntityKind::People => "peopleHistoryList",
        }
    }

    /// Key carrying the owning entity id on each wire record.
    pub fn id_key(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organizationId",
            EntityKind::People => "peopleId",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEntityKind(pub String);

impl fmt::Display for UnknownEntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown entity kind `{}` (expected organization or people)", self.0)
    }
}

impl std::error::Error for UnknownEntityKind {}

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "organization" | "organizations" => Ok(EntityKind::Organization),
            "people" | "person" => Ok(EntityKind::People),
            other => Err(UnknownEntityKind(other.to_string())),
        }
    }
}

/// Value recorded by a field change: usually text, sometimes a nested object
/// (owner references) or a bare number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Structured(JsonValue),
}

impl Default for FieldValue {
    fn default() -> Self {
        FieldValue::Structured(JsonValue::Null)
    }
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            FieldValue::Structured(_) => None,
        }
    }

    /// Numeric reading used for counters; numeric strings are accepted.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Text(text) => text.trim().parse().ok(),
            FieldValue::Structured(JsonValue::Number(n)) => n.as_f64(),
            FieldValue::Structured(_) => None,
        }
    }

    /// Human-readable rendering: text as-is, anything else as compact JSON.
    pub fn display(&self) -> String {
        match self {
            FieldValue::Text(text) => text.clone(),
            FieldValue::Structured(JsonValue::Null) => String::new(),
            FieldValue::Structured(value) => value.to_string(),
        }
    }
}

/// One field-change event as listed by the upstream history endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    #[serde(alias = "organizationId", alias = "peopleId")]
    pub entity_id: String,
    #[serde(rename = "type", default)]
    pub record_type: String,
    pub field_name: String,
    #[serde(default)]
    pub field_value: FieldValue,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Read one wire record listed under `kind`. When both id keys are
    /// present, the one belonging to `kind` wins.
    pub fn from_wire(kind: EntityKind, mut value: JsonValue) -> Result<Self, serde_json::Error> {
        if let Some(obj) = value.as_object_mut() {
            if obj.contains_key(kind.id_key()) {
                for other in EntityKind::ALL.into_iter().filter(|k| *k != kind) {
                    obj.remove(other.id_key());
                }
            }
        }
        serde_json::from_value(value)
    }

    /// Re-emit the record in the upstream wire shape for `kind`.
    pub fn to_wire_json(&self, kind: EntityKind) -> JsonValue {
        let mut obj = serde_json::Map::new();
        obj.insert("id".into(), JsonValue::String(self.id.clone()));
        obj.insert(kind.id_key().into(), JsonValue::String(self.entity_id.clone()));
        obj.insert("type".into(), JsonValue::String(self.record_type.clone()));
        obj.insert("fieldName".into(), JsonValue::String(self.field_name.clone()));
        obj.insert(
            "fieldValue".into(),
            serde_json::to_value(&self.field_value).unwrap_or(JsonValue::Null),
        );
        obj.insert(
            "ownerId".into(),
            self.owner_id
                .clone()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        );
        obj.insert(
            "createdAt".into(),
            JsonValue::String(self.created_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );
        JsonValue::Object(obj)
    }
}

/// One page of history; `next_cursor == None` ends pagination.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPage {
    pub records: Vec<HistoryRecord>,
    pub next_cursor: Option<String>,
}

impl CursorPage {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// The four UTM parameters, each recorded upstream as its own field change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtmField {
    Source,
    Medium,
    Campaign,
    Content,
}

impl UtmField {
    pub const ALL: [UtmField; 4] = [
        UtmField::Source,
        UtmField::Medium,
        UtmField::Campaign,
        UtmField::Content,
    ];
}

/// A grouped UTM snapshot reconstructed from separate field changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtmTouch {
    pub created_at: DateTime<Utc>,
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub content: Option<String>,
}

impl UtmTouch {
    pub fn at(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            source: None,
            medium: None,
            campaign: None,
            content: None,
        }
    }

    pub fn get(&self, field: UtmField) -> Option<&str> {
        match field {
            UtmField::Source => self.source.as_deref(),
            UtmField::Medium => self.medium.as_deref(),
            UtmField::Campaign => self.campaign.as_deref(),
            UtmField::Content => self.content.as_deref(),
        }
    }

    pub fn set(&mut self, field: UtmField, value: String) {
        let slot = match field {
            UtmField::Source => &mut self.source,
            UtmField::Medium => &mut self.medium,
            UtmField::Campaign => &mut self.campaign,
            UtmField::Content => &mut self.content,
        };
        *slot = Some(value);
    }
}

/// Attribution facts derived for a single entity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributionSummary {
    /// Newest first.
    pub utm_touches: Vec<UtmTouch>,
    pub first_touch: Option<UtmTouch>,
    pub deal_created_at: Option<DateTime<Utc>>,
    pub pre_deal_touch: Option<UtmTouch>,
    pub conversion_days: Option<i64>,
}

/// Display names the CRM uses for the fields the analysis reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldNames {
    pub utm_source: String,
    pub utm_medium: String,
    pub utm_campaign: String,
    pub utm_content: String,
    pub deal_count: String,
    pub name: String,
    pub email: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            utm_source: "utm_source".to_string(),
            utm_medium: "utm_medium".to_string(),
            utm_campaign: "utm_campaign".to_string(),
            utm_content: "utm_content".to_string(),
            deal_count: "딜 개수".to_string(),
            name: "이름".to_string(),
            email: "이메일".to_string(),
        }
    }
}

impl FieldNames {
    /// Missing keys keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn utm_field_name(&self, field: UtmField) -> &str {
        match field {
            UtmField::Source => &self.utm_source,
            UtmField::Medium => &self.utm_medium,
            UtmField::Campaign => &self.utm_campaign,
            UtmField::Content => &self.utm_content,
        }
    }

    pub fn utm_field(&self, field_name: &str) -> Option<UtmField> {
        UtmField::ALL
            .into_iter()
            .find(|f| self.utm_field_name(*f) == field_name)
    }

    pub fn is_utm(&self, record: &HistoryRecord) -> bool {
        self.utm_field(&record.field_name).is_some()
    }
}

/// Calendar-minute key: timestamps in the same UTC minute share a key.
pub fn minute_bucket(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(60)
}
