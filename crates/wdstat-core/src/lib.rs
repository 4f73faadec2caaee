//! Core domain model for wdstat: Wikibase claim shapes, dataset entries and change operations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "wdstat-core";

/// Property identifiers used by the locality pipelines.
pub mod properties {
    pub const COUNTRY: &str = "P17";
    pub const LOCATED_IN_ADMINISTRATIVE: &str = "P131";
    pub const STATED_IN: &str = "P248";
    pub const MUNICIPALITY_CODE: &str = "P525";
    pub const POINT_IN_TIME: &str = "P585";
    pub const URBAN_AREA_CODE: &str = "P775";
    pub const MINOR_URBAN_AREA_CODE: &str = "P776";
    pub const RETRIEVED: &str = "P813";
    pub const POPULATION: &str = "P1082";
    pub const AREA: &str = "P2046";
}

pub const GREGORIAN_CALENDAR: &str = "http://www.wikidata.org/entity/Q1985727";
pub const DAY_PRECISION: u8 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnakType {
    #[default]
    Value,
    SomeValue,
    NoValue,
}

/// `{"type": ..., "value": ...}` as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDataValue {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: JsonValue,
}

/// Typed snak value. Kinds the pipeline never inspects are carried verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawDataValue", into = "RawDataValue")]
pub enum DataValue {
    Item(ItemValue),
    Quantity(QuantityValue),
    Time(TimeValue),
    String(String),
    Other(RawDataValue),
}

impl From<RawDataValue> for DataValue {
    fn from(raw: RawDataValue) -> Self {
        let parsed = match raw.kind.as_str() {
            "wikibase-entityid" => serde_json::from_value(raw.value.clone())
                .ok()
                .map(DataValue::Item),
            "quantity" => serde_json::from_value(raw.value.clone())
                .ok()
                .map(DataValue::Quantity),
            "time" => serde_json::from_value(raw.value.clone())
                .ok()
                .map(DataValue::Time),
            "string" => raw.value.as_str().map(|s| DataValue::String(s.to_string())),
            _ => None,
        };
        parsed.unwrap_or(DataValue::Other(raw))
    }
}

impl From<DataValue> for RawDataValue {
    fn from(value: DataValue) -> Self {
        let (kind, value) = match value {
            DataValue::Item(v) => ("wikibase-entityid", serde_json::to_value(v)),
            DataValue::Quantity(v) => ("quantity", serde_json::to_value(v)),
            DataValue::Time(v) => ("time", serde_json::to_value(v)),
            DataValue::String(v) => ("string", Ok(JsonValue::String(v))),
            DataValue::Other(raw) => return raw,
        };
        RawDataValue {
            kind: kind.to_string(),
            value: value.unwrap_or(JsonValue::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemValue {
    #[serde(rename = "entity-type")]
    pub entity_type: String,
    #[serde(rename = "numeric-id")]
    pub numeric_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ItemValue {
    pub fn item(numeric_id: u64) -> Self {
        Self {
            entity_type: "item".to_string(),
            numeric_id,
            id: None,
        }
    }

    pub fn qid(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("Q{}", self.numeric_id))
    }
}

/// Quantity with its amount kept as the remote decimal text so unchanged values
/// are sent back exactly as they were received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityValue {
    #[serde(deserialize_with = "amount_text")]
    pub amount: String,
    pub unit: String,
    #[serde(
        rename = "upperBound",
        default,
        deserialize_with = "optional_amount_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub upper_bound: Option<String>,
    #[serde(
        rename = "lowerBound",
        default,
        deserialize_with = "optional_amount_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub lower_bound: Option<String>,
}

impl QuantityValue {
    /// Rounds `value` to an integer with a symmetric ±1 bound.
    pub fn integral(value: f64, unit: &str) -> Self {
        let rounded = value.round() as i64;
        Self {
            amount: signed_amount(rounded),
            unit: unit.to_string(),
            upper_bound: Some(signed_amount(rounded + 1)),
            lower_bound: Some(signed_amount(rounded - 1)),
        }
    }

    pub fn amount_value(&self) -> Option<f64> {
        self.amount.trim_start_matches('+').parse().ok()
    }
}

pub fn signed_amount(value: i64) -> String {
    if value < 0 {
        value.to_string()
    } else {
        format!("+{value}")
    }
}

fn number_text(value: JsonValue) -> Result<String, String> {
    match value {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => {
            let text = n.to_string();
            if text.starts_with('-') {
                Ok(text)
            } else {
                Ok(format!("+{text}"))
            }
        }
        other => Err(format!("invalid quantity amount {other}")),
    }
}

fn amount_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    number_text(JsonValue::deserialize(deserializer)?).map_err(D::Error::custom)
}

fn optional_amount_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => number_text(value).map(Some).map_err(D::Error::custom),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeValue {
    pub time: String,
    #[serde(default)]
    pub timezone: i64,
    #[serde(default)]
    pub before: i64,
    #[serde(default)]
    pub after: i64,
    pub precision: u8,
    pub calendarmodel: String,
}

impl TimeValue {
    pub fn day(time: &str) -> Self {
        Self {
            time: time.to_string(),
            timezone: 0,
            before: 0,
            after: 0,
            precision: DAY_PRECISION,
            calendarmodel: GREGORIAN_CALENDAR.to_string(),
        }
    }
}

/// Atomic property-value assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snak {
    #[serde(default)]
    pub snaktype: SnakType,
    pub property: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datavalue: Option<DataValue>,
}

impl Snak {
    fn value(property: &str, datavalue: DataValue) -> Self {
        Self {
            snaktype: SnakType::Value,
            property: property.to_string(),
            hash: None,
            datatype: None,
            datavalue: Some(datavalue),
        }
    }

    pub fn item(property: &str, numeric_id: u64) -> Self {
        Self::value(property, DataValue::Item(ItemValue::item(numeric_id)))
    }

    pub fn quantity(property: &str, value: f64, unit: &str) -> Self {
        Self::value(property, DataValue::Quantity(QuantityValue::integral(value, unit)))
    }

    pub fn time(property: &str, time: &str) -> Self {
        Self::value(property, DataValue::Time(TimeValue::day(time)))
    }

    pub fn string(property: &str, value: &str) -> Self {
        Self::value(property, DataValue::String(value.to_string()))
    }

    pub fn item_id(&self) -> Option<String> {
        match &self.datavalue {
            Some(DataValue::Item(item)) => Some(item.qid()),
            _ => None,
        }
    }

    pub fn item_numeric_id(&self) -> Option<u64> {
        match &self.datavalue {
            Some(DataValue::Item(item)) => Some(item.numeric_id),
            _ => None,
        }
    }

    pub fn quantity_value(&self) -> Option<&QuantityValue> {
        match &self.datavalue {
            Some(DataValue::Quantity(q)) => Some(q),
            _ => None,
        }
    }

    pub fn quantity_amount(&self) -> Option<f64> {
        self.quantity_value().and_then(QuantityValue::amount_value)
    }

    pub fn time_value(&self) -> Option<&TimeValue> {
        match &self.datavalue {
            Some(DataValue::Time(t)) => Some(t),
            _ => None,
        }
    }

    pub fn string_value(&self) -> Option<&str> {
        match &self.datavalue {
            Some(DataValue::String(s)) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualifier {
    pub property: String,
    pub snak: Snak,
}

impl Qualifier {
    pub fn new(property: &str, snak: Snak) -> Self {
        Self {
            property: property.to_string(),
            snak,
        }
    }
}

/// Provenance block: snaks grouped by property plus their explicit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, deserialize_with = "map_or_empty_list")]
    pub snaks: BTreeMap<String, Vec<Snak>>,
    #[serde(rename = "snaks-order", default)]
    pub snaks_order: Vec<String>,
}

impl Reference {
    pub fn from_snaks(snaks: Vec<Snak>) -> Self {
        let mut grouped: BTreeMap<String, Vec<Snak>> = BTreeMap::new();
        let mut order = Vec::new();
        for snak in snaks {
            if !grouped.contains_key(&snak.property) {
                order.push(snak.property.clone());
            }
            grouped.entry(snak.property.clone()).or_default().push(snak);
        }
        Self {
            hash: None,
            snaks: grouped,
            snaks_order: order,
        }
    }

    /// The canonical shape: a "stated in" item followed by a "retrieved" date.
    pub fn stated_in_retrieved(stated_in_numeric_id: u64, retrieved: &str) -> Self {
        Self::from_snaks(vec![
            Snak::item(properties::STATED_IN, stated_in_numeric_id),
            Snak::time(properties::RETRIEVED, retrieved),
        ])
    }

    pub fn snaks_for(&self, property: &str) -> &[Snak] {
        self.snaks.get(property).map(Vec::as_slice).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Preferred,
    #[default]
    Normal,
    Deprecated,
}

fn statement_type() -> String {
    "statement".to_string()
}

/// One statement about an entity. `qualifiers_order` always lists exactly the
/// keys of `qualifiers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub mainsnak: Snak,
    #[serde(rename = "type", default = "statement_type")]
    pub statement_type: String,
    #[serde(default)]
    pub rank: Rank,
    #[serde(
        default,
        deserialize_with = "map_or_empty_list",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub qualifiers: BTreeMap<String, Vec<Snak>>,
    #[serde(
        rename = "qualifiers-order",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub qualifiers_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
}

impl Claim {
    pub fn new(mainsnak: Snak, references: Vec<Reference>, qualifiers: Vec<Qualifier>) -> Self {
        let mut claim = Self {
            id: None,
            mainsnak,
            statement_type: statement_type(),
            rank: Rank::Normal,
            qualifiers: BTreeMap::new(),
            qualifiers_order: Vec::new(),
            references,
        };
        claim.set_qualifiers(qualifiers);
        claim
    }

    pub fn set_qualifiers(&mut self, qualifiers: Vec<Qualifier>) {
        self.qualifiers.clear();
        self.qualifiers_order.clear();
        for qualifier in qualifiers {
            if !self.qualifiers.contains_key(&qualifier.property) {
                self.qualifiers_order.push(qualifier.property.clone());
            }
            self.qualifiers
                .entry(qualifier.property)
                .or_default()
                .push(qualifier.snak);
        }
    }

    pub fn qualifier_snaks(&self, property: &str) -> &[Snak] {
        self.qualifiers
            .get(property)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn amount(&self) -> Option<f64> {
        self.mainsnak.quantity_amount()
    }

    /// Returns a copy with the edited fields replaced and everything else,
    /// identity included, preserved.
    pub fn with_edit(&self, edit: ClaimEdit) -> Self {
        let mut claim = self.clone();
        if let Some(mainsnak) = edit.mainsnak {
            claim.mainsnak = mainsnak;
        }
        if let Some(qualifiers) = edit.qualifiers {
            claim.set_qualifiers(qualifiers);
        }
        if let Some(references) = edit.references {
            claim.references = references;
        }
        claim
    }
}

/// Partial claim fields applied by an edit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClaimEdit {
    pub mainsnak: Option<Snak>,
    pub qualifiers: Option<Vec<Qualifier>>,
    pub references: Option<Vec<Reference>>,
}

/// One remote mutation, produced by reconciliation and consumed by submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    AddLabel { language: String, value: String },
    AddClaim { claim: Claim },
    EditClaim { id: String, claim: Claim },
    RemoveClaim { id: String },
}

impl Change {
    pub fn add_label(language: &str, value: &str) -> Self {
        Self::AddLabel {
            language: language.to_string(),
            value: value.to_string(),
        }
    }

    pub fn add_claim(mut claim: Claim) -> Self {
        claim.id = None;
        Self::AddClaim { claim }
    }

    /// `None` when `existing` has never been created remotely.
    pub fn edit_claim(existing: &Claim, edit: ClaimEdit) -> Option<Self> {
        let id = existing.id.clone()?;
        Some(Self::EditClaim {
            id,
            claim: existing.with_edit(edit),
        })
    }

    pub fn remove_claim(id: &str) -> Self {
        Self::RemoveClaim { id: id.to_string() }
    }

    pub fn claim(&self) -> Option<&Claim> {
        match self {
            Self::AddClaim { claim } | Self::EditClaim { claim, .. } => Some(claim),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelPayload {
    pub language: String,
    pub value: String,
    pub add: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClaimPayload {
    Upsert(Claim),
    Remove { id: String, remove: String },
}

/// `data` body of an entity edit: label and claim buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct EditPayload {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelPayload>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub claims: Vec<ClaimPayload>,
}

impl EditPayload {
    pub fn from_changes(changes: &[Change]) -> Self {
        let mut payload = Self::default();
        for change in changes {
            match change {
                Change::AddLabel { language, value } => payload.labels.push(LabelPayload {
                    language: language.clone(),
                    value: value.clone(),
                    add: String::new(),
                }),
                Change::AddClaim { claim } => payload.claims.push(ClaimPayload::Upsert(claim.clone())),
                Change::EditClaim { id, claim } => {
                    let mut claim = claim.clone();
                    claim.id = Some(id.clone());
                    payload.claims.push(ClaimPayload::Upsert(claim));
                }
                Change::RemoveClaim { id } => payload.claims.push(ClaimPayload::Remove {
                    id: id.clone(),
                    remove: String::new(),
                }),
            }
        }
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub language: String,
    pub value: String,
}

/// Read-only snapshot of a remote item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub id: String,
    #[serde(default, deserialize_with = "map_or_empty_list")]
    pub labels: BTreeMap<String, Label>,
    #[serde(default, deserialize_with = "map_or_empty_list")]
    pub descriptions: BTreeMap<String, Label>,
    #[serde(default, deserialize_with = "map_or_empty_list")]
    pub claims: BTreeMap<String, Vec<Claim>>,
}

impl RemoteEntity {
    pub fn label(&self, language: &str) -> Option<&str> {
        self.labels.get(language).map(|l| l.value.as_str())
    }

    pub fn claims_for(&self, property: &str) -> &[Claim] {
        self.claims
            .get(property)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// The remote API encodes empty maps as `[]`.
fn map_or_empty_list<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => Ok(BTreeMap::new()),
        JsonValue::Array(items) if items.is_empty() => Ok(BTreeMap::new()),
        other => serde_json::from_value(other).map_err(D::Error::custom),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Population,
    Area,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Population => "population",
            Self::Area => "area",
        }
    }
}

/// Locally authoritative per-year measurements for one area, keyed by two-digit year code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    #[serde(default)]
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub municipality: String,
    #[serde(default)]
    pub population: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    pub area: BTreeMap<String, Option<f64>>,
}

impl Area {
    pub fn series(&self, metric: Metric) -> &BTreeMap<String, Option<f64>> {
        match metric {
            Metric::Population => &self.population,
            Metric::Area => &self.area,
        }
    }

    /// Null and zero both count as "no value".
    pub fn value(&self, metric: Metric, year: &str) -> Option<f64> {
        self.series(metric)
            .get(year)
            .copied()
            .flatten()
            .filter(|v| *v != 0.0)
    }

    pub fn trimmed_name(&self) -> &str {
        self.name.trim()
    }
}

/// Immutable reference dataset for one area kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    areas: BTreeMap<String, Area>,
}

impl Dataset {
    pub fn from_areas(areas: impl IntoIterator<Item = Area>) -> Self {
        Self {
            areas: areas.into_iter().map(|a| (a.code.clone(), a)).collect(),
        }
    }

    pub fn lookup(&self, code: &str) -> Option<&Area> {
        self.areas.get(code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.areas.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}

/// Which statistical locality family a run synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaKind {
    Urban,
    Minor,
}

impl AreaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urban => "urban",
            Self::Minor => "minor",
        }
    }

    pub fn code_property(&self) -> &'static str {
        match self {
            Self::Urban => properties::URBAN_AREA_CODE,
            Self::Minor => properties::MINOR_URBAN_AREA_CODE,
        }
    }

    pub fn code_prefix(&self) -> char {
        match self {
            Self::Urban => 'T',
            Self::Minor => 'S',
        }
    }

    /// Error category recorded when the dataset has no entry for a resolved code.
    pub fn missing_entry_error(&self) -> &'static str {
        match self {
            Self::Urban => "urbanArea missing",
            Self::Minor => "minorUrbanAreaCode missing",
        }
    }
}

impl fmt::Display for AreaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AreaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urban" => Ok(Self::Urban),
            "minor" => Ok(Self::Minor),
            other => Err(format!("unknown area kind `{other}` (expected urban or minor)")),
        }
    }
}

/// Per-entity run bookkeeping persisted by the progress store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    pub kind: AreaKind,
    #[serde(default)]
    pub labels: BTreeMap<String, Label>,
    #[serde(default)]
    pub area_code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub municipality: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Raw claims kept for manual review of skipped entities.
    #[serde(default)]
    pub review_claims: BTreeMap<String, Vec<Claim>>,
    #[serde(default)]
    pub changed: bool,
    #[serde(default)]
    pub edits: Vec<Change>,
    #[serde(default)]
    pub edits_digest: Option<String>,
    #[serde(default)]
    pub flags: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(entity_id: &str, kind: AreaKind, updated_at: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            kind,
            labels: BTreeMap::new(),
            area_code: None,
            name: None,
            municipality: None,
            error: None,
            review_claims: BTreeMap::new(),
            changed: false,
            edits: Vec::new(),
            edits_digest: None,
            flags: BTreeSet::new(),
            updated_at,
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }
}
