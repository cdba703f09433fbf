//! Attribution derivation over one entity's field-change history.
//!
//! Everything here is a pure function of the records passed in; nothing is
//! cached between passes.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use smap_core::{minute_bucket, AttributionSummary, FieldNames, HistoryRecord, UtmField, UtmTouch};
use tracing::trace;

pub const CRATE_NAME: &str = "smap-attribution";

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Records belonging to `entity_id`, in received order.
pub fn records_for_entity<'a>(records: &'a [HistoryRecord], entity_id: &str) -> Vec<&'a HistoryRecord> {
    records.iter().filter(|r| r.entity_id == entity_id).collect()
}

/// Partition by entity id. Each entity keeps its records in received order.
pub fn group_by_entity(records: &[HistoryRecord]) -> BTreeMap<&str, Vec<&HistoryRecord>> {
    let mut out: BTreeMap<&str, Vec<&HistoryRecord>> = BTreeMap::new();
    for record in records {
        out.entry(record.entity_id.as_str()).or_default().push(record);
    }
    out
}

/// Latest-by-time name and email of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityFields {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EntityAttribution {
    pub entity_id: String,
    pub identity: IdentityFields,
    pub has_utm: bool,
    pub summary: AttributionSummary,
}

#[derive(Debug, Clone, Default)]
pub struct AttributionAnalyzer {
    fields: FieldNames,
}

impl AttributionAnalyzer {
    pub fn new(fields: FieldNames) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &FieldNames {
        &self.fields
    }

    /// Derive the full summary. `records` must already be restricted to one
    /// entity.
    pub fn analyze(&self, records: &[&HistoryRecord]) -> AttributionSummary {
        let utm_touches = self.group_utm_touches(records);
        let first_touch = self.first_touch(records, &utm_touches);
        let deal_created_at = self.deal_created_at(records);
        let pre_deal_touch = deal_created_at.and_then(|deal| self.pre_deal_touch(records, deal));
        let conversion_days = match (&first_touch, deal_created_at) {
            (Some(first), Some(deal)) => Some(conversion_days(first.created_at, deal)),
            _ => None,
        };

        AttributionSummary {
            utm_touches,
            first_touch,
            deal_created_at,
            pre_deal_touch,
            conversion_days,
        }
    }

    /// Analyze every entity in a mixed collection, ordered by entity id.
    pub fn analyze_all(&self, records: &[HistoryRecord]) -> Vec<EntityAttribution> {
        group_by_entity(records)
            .into_iter()
            .map(|(entity_id, entity_records)| EntityAttribution {
                entity_id: entity_id.to_string(),
                identity: self.identity(&entity_records),
                has_utm: self.has_utm(&entity_records),
                summary: self.analyze(&entity_records),
            })
            .collect()
    }

    pub fn has_utm(&self, records: &[&HistoryRecord]) -> bool {
        records.iter().any(|r| self.fields.is_utm(r))
    }

    /// One touch per distinct `utm_source` timestamp, newest first. Medium,
    /// campaign and content join the source group opened in the same calendar
    /// minute; members with no such group are dropped.
    pub fn group_utm_touches(&self, records: &[&HistoryRecord]) -> Vec<UtmTouch> {
        let mut touches: Vec<UtmTouch> = Vec::new();
        let mut by_timestamp: HashMap<DateTime<Utc>, usize> = HashMap::new();
        let mut by_minute: HashMap<i64, usize> = HashMap::new();

        for record in records
            .iter()
            .filter(|r| self.fields.utm_field(&r.field_name) == Some(UtmField::Source))
        {
            let idx = *by_timestamp.entry(record.created_at).or_insert_with(|| {
                touches.push(UtmTouch::at(record.created_at));
                touches.len() - 1
            });
            set_if_present(&mut touches[idx], UtmField::Source, record);
            // First source seen in a minute owns that minute.
            by_minute.entry(minute_bucket(record.created_at)).or_insert(idx);
        }

        for record in records {
            let Some(field) = self.fields.utm_field(&record.field_name) else {
                continue;
            };
            if field == UtmField::Source {
                continue;
            }
            match by_minute.get(&minute_bucket(record.created_at)) {
                Some(&idx) => set_if_present(&mut touches[idx], field, record),
                None => trace!(record_id = %record.id, ?field, "utm value without same-minute source"),
            }
        }

        touches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        touches
    }

    /// The group of the earliest `utm_source` record.
    pub fn first_touch(&self, records: &[&HistoryRecord], touches: &[UtmTouch]) -> Option<UtmTouch> {
        let earliest = records
            .iter()
            .filter(|r| self.fields.utm_field(&r.field_name) == Some(UtmField::Source))
            .map(|r| r.created_at)
            .min()?;
        touches.iter().find(|t| t.created_at == earliest).cloned()
    }

    /// Deal-count records are scanned from the back of the received list
    /// (upstream lists newest first), without re-sorting; the first value
    /// above zero marks the deal.
    pub fn deal_created_at(&self, records: &[&HistoryRecord]) -> Option<DateTime<Utc>> {
        records
            .iter()
            .rev()
            .filter(|r| r.field_name == self.fields.deal_count)
            .find(|r| r.field_value.as_f64().is_some_and(|v| v > 0.0))
            .map(|r| r.created_at)
    }

    /// Each UTM lane's latest value strictly before the deal, chosen
    /// independently and combined. The lanes may come from different
    /// sessions; the touch is stamped with the latest chosen time.
    pub fn pre_deal_touch(&self, records: &[&HistoryRecord], deal_created_at: DateTime<Utc>) -> Option<UtmTouch> {
        let mut chosen: Vec<(UtmField, &HistoryRecord)> = Vec::new();
        for field in UtmField::ALL {
            let name = self.fields.utm_field_name(field);
            let latest = records
                .iter()
                .filter(|r| r.field_name == name && r.created_at < deal_created_at)
                .max_by_key(|r| r.created_at);
            if let Some(record) = latest {
                chosen.push((field, *record));
            }
        }

        let stamp = chosen.iter().map(|(_, r)| r.created_at).max()?;
        let mut touch = UtmTouch::at(stamp);
        for (field, record) in chosen {
            set_if_present(&mut touch, field, record);
        }
        Some(touch)
    }

    pub fn identity(&self, records: &[&HistoryRecord]) -> IdentityFields {
        IdentityFields {
            name: latest_text(records, &self.fields.name),
            email: latest_text(records, &self.fields.email),
        }
    }
}

/// Whole days between first touch and deal creation, floored. Negative when
/// the deal predates the touch.
pub fn conversion_days(first_touch_at: DateTime<Utc>, deal_created_at: DateTime<Utc>) -> i64 {
    (deal_created_at - first_touch_at)
        .num_milliseconds()
        .div_euclid(MILLIS_PER_DAY)
}

fn set_if_present(touch: &mut UtmTouch, field: UtmField, record: &HistoryRecord) {
    let value = record.field_value.display();
    if !value.is_empty() {
        touch.set(field, value);
    }
}

fn latest_text(records: &[&HistoryRecord], field_name: &str) -> Option<String> {
    records
        .iter()
        .filter(|r| r.field_name == field_name)
        .max_by_key(|r| r.created_at)
        .map(|r| r.field_value.display())
        .filter(|v| !v.is_empty())
}
