//! Reconciliation of remote quantity claims against the reference dataset.
//!
//! [`reconcile`] runs four ordered phases over one entity: jurisdiction gate,
//! label fill, per-claim repair and year fill. [`repair_references`] is the
//! narrower pass that only swaps legacy references for canonical ones.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use wdstat_core::properties::{
    AREA, COUNTRY, LOCATED_IN_ADMINISTRATIVE, MUNICIPALITY_CODE, POINT_IN_TIME, POPULATION,
    STATED_IN,
};
use wdstat_core::{
    Area, AreaKind, Change, Claim, ClaimEdit, Dataset, Metric, Qualifier, Reference, RemoteEntity,
    Snak, DAY_PRECISION,
};

pub const CRATE_NAME: &str = "wdstat-reconcile";

pub const SWEDEN: &str = "Q34";
pub const HECTARE_UNIT: &str = "http://www.wikidata.org/entity/Q35852";
pub const UNITLESS: &str = "1";
pub const STATISTICS_DATABASE: u64 = 27_579_148;
pub const STATISTICS_DATABASE_MINOR: u64 = 27_704_297;
pub const LOCALITIES_2010: u64 = 14_907_217;
pub const RETRIEVED_AT: &str = "+2016-11-01T00:00:00Z";

pub const STANDARD_YEARS: [&str; 10] = ["60", "65", "70", "75", "80", "90", "95", "00", "05", "10"];

/// Recognized two-digit year codes and the point-in-time strings that map onto them.
#[derive(Debug, Clone, PartialEq)]
pub struct YearTable {
    years: Vec<String>,
    times: BTreeMap<String, String>,
}

impl YearTable {
    pub fn new(codes: &[&str]) -> Self {
        let mut times = BTreeMap::new();
        for code in codes {
            let year = Self::calendar_year(code);
            for suffix in ["00-00", "12-00", "12-31"] {
                times.insert(format!("+{year:04}-{suffix}T00:00:00Z"), code.to_string());
            }
        }
        if codes.contains(&"10") {
            times.insert("+2010-01-01T00:00:00Z".to_string(), "10".to_string());
        }
        Self {
            years: codes.iter().map(|c| c.to_string()).collect(),
            times,
        }
    }

    pub fn standard() -> Self {
        Self::new(&STANDARD_YEARS)
    }

    /// Codes in ascending chronological order.
    pub fn years(&self) -> &[String] {
        &self.years
    }

    /// Codes below 20 are 20xx, the rest 19xx.
    pub fn calendar_year(code: &str) -> i32 {
        let two_digit: i32 = code.parse().unwrap_or_default();
        if two_digit < 20 {
            2000 + two_digit
        } else {
            1900 + two_digit
        }
    }

    pub fn canonical_time(code: &str) -> String {
        format!("+{:04}-12-31T00:00:00Z", Self::calendar_year(code))
    }

    /// Maps a time string onto its year code. A URL-escaped leading sign is tolerated.
    pub fn recognize(&self, time: &str) -> Option<&str> {
        let normalized = match time.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("%2b") => format!("+{}", &time[3..]),
            _ => time.to_string(),
        };
        self.times.get(&normalized).map(String::as_str)
    }

    pub fn qualifier(&self, code: &str) -> Qualifier {
        Qualifier::new(
            POINT_IN_TIME,
            Snak::time(POINT_IN_TIME, &Self::canonical_time(code)),
        )
    }

    fn position(&self, code: &str) -> usize {
        self.years
            .iter()
            .position(|y| y == code)
            .unwrap_or(usize::MAX)
    }
}

/// One reconciled quantity property and its canonical references.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantityProperty {
    pub metric: Metric,
    pub property: String,
    pub unit: String,
    pub references: Vec<Reference>,
}

/// Every constant the engine consults, threaded through as one value.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    pub kind: AreaKind,
    pub jurisdiction: String,
    pub source_language: String,
    pub target_language: String,
    /// Processed in order: population before area.
    pub quantities: Vec<QuantityProperty>,
    pub years: YearTable,
    /// Stated-in item of references that the repair pass replaces.
    pub legacy_stated_in: u64,
}

impl ReconcileConfig {
    pub fn for_kind(kind: AreaKind) -> Self {
        let stated_in = match kind {
            AreaKind::Urban => STATISTICS_DATABASE,
            AreaKind::Minor => STATISTICS_DATABASE_MINOR,
        };
        let references = vec![Reference::stated_in_retrieved(stated_in, RETRIEVED_AT)];
        Self {
            kind,
            jurisdiction: SWEDEN.to_string(),
            source_language: "sv".to_string(),
            target_language: "en".to_string(),
            quantities: vec![
                QuantityProperty {
                    metric: Metric::Population,
                    property: POPULATION.to_string(),
                    unit: UNITLESS.to_string(),
                    references: references.clone(),
                },
                QuantityProperty {
                    metric: Metric::Area,
                    property: AREA.to_string(),
                    unit: HECTARE_UNIT.to_string(),
                    references,
                },
            ],
            years: YearTable::standard(),
            legacy_stated_in: LOCALITIES_2010,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    AmbiguousData,
}

/// Reasons an entity is skipped without any remote write.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    #[error("no country")]
    NoCountry,
    #[error("not in sweden")]
    WrongJurisdiction {
        found: Option<String>,
        claims: Vec<Claim>,
    },
    #[error("not one area code")]
    AmbiguousAreaCode { property: String, claims: Vec<Claim> },
    #[error("{}", .kind.missing_entry_error())]
    AreaMissing {
        kind: AreaKind,
        code: String,
        claims: Vec<Claim>,
    },
}

impl ReconcileError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoCountry | Self::WrongJurisdiction { .. } => ErrorCategory::Validation,
            Self::AmbiguousAreaCode { .. } | Self::AreaMissing { .. } => ErrorCategory::AmbiguousData,
        }
    }

    /// Raw claims worth keeping for manual review, keyed by property.
    pub fn review_claims(&self) -> Option<(&str, &[Claim])> {
        match self {
            Self::WrongJurisdiction { claims, .. } => Some((COUNTRY, claims.as_slice())),
            Self::AmbiguousAreaCode { property, claims } => {
                Some((property.as_str(), claims.as_slice()))
            }
            Self::AreaMissing { kind, claims, .. } => Some((kind.code_property(), claims.as_slice())),
            _ => None,
        }
    }
}

/// Finds the dataset code for `entity`, applying the historical two-code rules.
pub fn resolve_area_code(
    entity: &RemoteEntity,
    kind: AreaKind,
    dataset: &Dataset,
) -> Result<String, ReconcileError> {
    let property = kind.code_property();
    let claims = entity.claims_for(property);
    let ambiguous = || ReconcileError::AmbiguousAreaCode {
        property: property.to_string(),
        claims: claims.to_vec(),
    };

    let code = match claims {
        [single] => single
            .mainsnak
            .string_value()
            .map(str::to_string)
            .ok_or_else(ambiguous)?,
        [a, b] => {
            let (Some(a), Some(b)) = (a.mainsnak.string_value(), b.mainsnak.string_value()) else {
                return Err(ambiguous());
            };
            let mut codes = [a.to_uppercase(), b.to_uppercase()];
            codes.sort();
            pick_between_codes(&codes[0], &codes[1], kind, dataset).ok_or_else(ambiguous)?
        }
        _ => return Err(ambiguous()),
    };

    if code.starts_with(|c: char| c.is_ascii_digit()) {
        Ok(format!("{}{code}", kind.code_prefix()))
    } else {
        Ok(code)
    }
}

fn pick_between_codes(first: &str, second: &str, kind: AreaKind, dataset: &Dataset) -> Option<String> {
    if first == second {
        return Some(second.to_string());
    }
    if second.strip_prefix(kind.code_prefix()) == Some(first) {
        return Some(second.to_string());
    }
    let t_digit = first.strip_prefix('T').is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()));
    if kind == AreaKind::Urban && t_digit && second.starts_with("TX") {
        return if dataset.contains(first) {
            Some(first.to_string())
        } else {
            Some(second.to_string())
        };
    }
    None
}

/// Resolves the entity's code and looks it up.
pub fn resolve_area<'a>(
    entity: &RemoteEntity,
    kind: AreaKind,
    dataset: &'a Dataset,
) -> Result<(String, &'a Area), ReconcileError> {
    let code = resolve_area_code(entity, kind, dataset)?;
    match dataset.lookup(&code) {
        Some(area) => Ok((code, area)),
        None => Err(ReconcileError::AreaMissing {
            kind,
            code,
            claims: entity.claims_for(kind.code_property()).to_vec(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelMismatch {
    pub dataset_name: String,
    pub remote_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "note", rename_all = "snake_case")]
pub enum NoteKind {
    ManualReview,
    UnknownYear { time: Option<String> },
    ReferencesAttached { year: String },
    ValueCorrected { year: String, from: Option<f64>, to: f64 },
    YearInferred { year: String },
    Obsolete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimNote {
    pub property: String,
    pub claim_id: Option<String>,
    #[serde(flatten)]
    pub kind: NoteKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Addition {
    pub metric: Metric,
    pub year: String,
    pub value: f64,
}

/// What the engine observed while reconciling, for the progress record and logs.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Diagnostics {
    pub located_in_claims: usize,
    pub municipality_code_claims: usize,
    pub label_mismatch: Option<LabelMismatch>,
    pub notes: Vec<ClaimNote>,
    pub additions: Vec<Addition>,
}

impl Diagnostics {
    fn note(&mut self, property: &str, claim: &Claim, kind: NoteKind) {
        self.notes.push(ClaimNote {
            property: property.to_string(),
            claim_id: claim.id.clone(),
            kind,
        });
    }

    pub fn needs_review(&self) -> bool {
        self.notes
            .iter()
            .any(|n| matches!(n.kind, NoteKind::ManualReview | NoteKind::UnknownYear { .. }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Label change first, then claim repairs, then additions.
    pub changes: Vec<Change>,
    pub diagnostics: Diagnostics,
}

/// Diffs `entity` against its dataset entry and returns the ordered changes.
pub fn reconcile(
    entity: &RemoteEntity,
    area: &Area,
    config: &ReconcileConfig,
) -> Result<Reconciliation, ReconcileError> {
    let mut diagnostics = Diagnostics::default();
    check_jurisdiction(entity, config, &mut diagnostics)?;

    let mut changes = Vec::new();
    changes.extend(fill_label(entity, area, config, &mut diagnostics));

    let mut repaired = Vec::with_capacity(config.quantities.len());
    for quantity in &config.quantities {
        let repair = repair_claims(entity, area, quantity, config, &mut diagnostics);
        changes.extend(repair.changes);
        repaired.push((quantity, repair.claims));
    }

    for year in config.years.years() {
        for (quantity, claims) in &repaired {
            changes.extend(fill_year(claims, area, quantity, year, config, &mut diagnostics));
        }
    }

    Ok(Reconciliation {
        changes,
        diagnostics,
    })
}

fn check_jurisdiction(
    entity: &RemoteEntity,
    config: &ReconcileConfig,
    diagnostics: &mut Diagnostics,
) -> Result<(), ReconcileError> {
    diagnostics.located_in_claims = entity.claims_for(LOCATED_IN_ADMINISTRATIVE).len();
    diagnostics.municipality_code_claims = entity.claims_for(MUNICIPALITY_CODE).len();

    let countries = entity.claims_for(COUNTRY);
    let Some(first) = countries.first() else {
        warn!(entity = %entity.id, "entity has no country");
        return Err(ReconcileError::NoCountry);
    };
    let found = first.mainsnak.item_id();
    if found.as_deref() != Some(config.jurisdiction.as_str()) {
        warn!(entity = %entity.id, country = ?found, "entity is outside the jurisdiction");
        return Err(ReconcileError::WrongJurisdiction {
            found,
            claims: countries.to_vec(),
        });
    }
    Ok(())
}

/// Adds a target-language label only when the source label already matches the dataset name.
fn fill_label(
    entity: &RemoteEntity,
    area: &Area,
    config: &ReconcileConfig,
    diagnostics: &mut Diagnostics,
) -> Option<Change> {
    let name = area.trimmed_name();
    match entity.label(&config.source_language) {
        Some(label) if label == name => {
            if entity.label(&config.target_language).is_none() {
                Some(Change::add_label(&config.target_language, name))
            } else {
                None
            }
        }
        other => {
            debug!(entity = %entity.id, dataset = name, remote = ?other, "label differs from dataset name");
            diagnostics.label_mismatch = Some(LabelMismatch {
                dataset_name: name.to_string(),
                remote_label: other.map(str::to_string),
            });
            None
        }
    }
}

enum Temporal<'a> {
    Absent,
    Multiple,
    Unrecognized(&'a Snak),
    Year(&'a str, &'a Snak),
}

fn temporal<'a>(claim: &'a Claim, years: &'a YearTable) -> Temporal<'a> {
    match claim.qualifier_snaks(POINT_IN_TIME) {
        [] => Temporal::Absent,
        [snak] => match snak.time_value().and_then(|t| years.recognize(&t.time)) {
            Some(year) => Temporal::Year(year, snak),
            None => Temporal::Unrecognized(snak),
        },
        _ => Temporal::Multiple,
    }
}

/// Keeps a day-precision qualifier snak and rewrites its time; anything coarser is replaced.
fn normalized_qualifier(existing: &Snak, year: &str, years: &YearTable) -> Qualifier {
    match existing.time_value() {
        Some(time) if time.precision >= DAY_PRECISION => {
            let mut snak = existing.clone();
            snak.hash = None;
            if let Some(wdstat_core::DataValue::Time(value)) = snak.datavalue.as_mut() {
                value.time = YearTable::canonical_time(year);
            }
            Qualifier::new(POINT_IN_TIME, snak)
        }
        _ => years.qualifier(year),
    }
}

/// Dataset value as it is written remotely: rounded to an integer.
fn dataset_amount(area: &Area, metric: Metric, year: &str) -> Option<f64> {
    area.value(metric, year).map(f64::round)
}

struct ClaimRepair {
    changes: Vec<Change>,
    /// Claim view after the repairs, for the year-fill phase.
    claims: Vec<Claim>,
}

fn repair_claims(
    entity: &RemoteEntity,
    area: &Area,
    quantity: &QuantityProperty,
    config: &ReconcileConfig,
    diagnostics: &mut Diagnostics,
) -> ClaimRepair {
    let property = quantity.property.as_str();
    let years = &config.years;
    let has_any_value = years
        .years()
        .iter()
        .any(|y| area.value(quantity.metric, y).is_some());

    let mut changes = Vec::new();
    let mut claims = Vec::new();

    for claim in entity.claims_for(property) {
        if claim.qualifiers.len() > 1 {
            warn!(entity = %entity.id, property, claim = ?claim.id, "claim has too many qualifiers");
            diagnostics.note(property, claim, NoteKind::ManualReview);
            claims.push(claim.clone());
            continue;
        }
        if !claim.references.is_empty() {
            claims.push(claim.clone());
            continue;
        }

        match temporal(claim, years) {
            Temporal::Multiple => {
                warn!(entity = %entity.id, property, claim = ?claim.id, "claim has several points in time");
                diagnostics.note(property, claim, NoteKind::ManualReview);
                claims.push(claim.clone());
            }
            Temporal::Unrecognized(snak) => {
                let time = snak.time_value().map(|t| t.time.clone());
                warn!(entity = %entity.id, property, time = ?time, "unknown year");
                diagnostics.note(property, claim, NoteKind::UnknownYear { time });
                claims.push(claim.clone());
            }
            Temporal::Year(year, snak) => {
                let Some(value) = dataset_amount(area, quantity.metric, year) else {
                    claims.push(claim.clone());
                    continue;
                };
                let current = claim.amount();
                let mainsnak = (current != Some(value))
                    .then(|| Snak::quantity(property, value, &quantity.unit));
                let corrected = mainsnak.is_some();
                let edit = ClaimEdit {
                    mainsnak,
                    qualifiers: Some(vec![normalized_qualifier(snak, year, years)]),
                    references: Some(quantity.references.clone()),
                };
                match Change::edit_claim(claim, edit) {
                    Some(change) => {
                        if corrected {
                            warn!(entity = %entity.id, property, year, from = ?current, to = value, "correcting value");
                            diagnostics.note(property, claim, NoteKind::ValueCorrected {
                                year: year.to_string(),
                                from: current,
                                to: value,
                            });
                        } else {
                            diagnostics.note(property, claim, NoteKind::ReferencesAttached {
                                year: year.to_string(),
                            });
                        }
                        if let Some(edited) = change.claim() {
                            claims.push(edited.clone());
                        }
                        changes.push(change);
                    }
                    None => claims.push(claim.clone()),
                }
            }
            Temporal::Absent => {
                if !has_any_value {
                    claims.push(claim.clone());
                    continue;
                }
                let current = claim.amount();
                let matched = years
                    .years()
                    .iter()
                    .find(|y| current.is_some() && dataset_amount(area, quantity.metric, y) == current);
                match (matched, claim.id.as_deref()) {
                    (Some(year), Some(_)) => {
                        let edit = ClaimEdit {
                            mainsnak: None,
                            qualifiers: Some(vec![years.qualifier(year)]),
                            references: Some(quantity.references.clone()),
                        };
                        if let Some(change) = Change::edit_claim(claim, edit) {
                            diagnostics.note(property, claim, NoteKind::YearInferred { year: year.clone() });
                            if let Some(edited) = change.claim() {
                                claims.push(edited.clone());
                            }
                            changes.push(change);
                        }
                    }
                    (None, Some(id)) => {
                        debug!(entity = %entity.id, property, claim = id, "removing unsupported claim");
                        diagnostics.note(property, claim, NoteKind::Obsolete);
                        changes.push(Change::remove_claim(id));
                    }
                    (_, None) => claims.push(claim.clone()),
                }
            }
        }
    }

    ClaimRepair { changes, claims }
}

/// True when every claim is tagged with a recognized year other than `year`.
fn is_free(claims: &[Claim], year: &str, years: &YearTable) -> bool {
    claims
        .iter()
        .all(|claim| matches!(temporal(claim, years), Temporal::Year(tagged, _) if tagged != year))
}

/// Adds `year` for one property when the dataset has a value and no claim covers it.
fn fill_year(
    claims: &[Claim],
    area: &Area,
    quantity: &QuantityProperty,
    year: &str,
    config: &ReconcileConfig,
    diagnostics: &mut Diagnostics,
) -> Option<Change> {
    let value = area.value(quantity.metric, year)?;
    if !is_free(claims, year, &config.years) {
        return None;
    }
    diagnostics.additions.push(Addition {
        metric: quantity.metric,
        year: year.to_string(),
        value,
    });
    Some(Change::add_claim(Claim::new(
        Snak::quantity(&quantity.property, value, &quantity.unit),
        quantity.references.clone(),
        vec![config.years.qualifier(year)],
    )))
}

/// Years touched by previously applied claim changes for `property`, ascending.
pub fn applied_years(applied: &[Change], property: &str, years: &YearTable) -> Vec<String> {
    let found: BTreeSet<&str> = applied
        .iter()
        .filter_map(Change::claim)
        .filter(|claim| claim.mainsnak.property == property)
        .filter_map(|claim| claim.qualifier_snaks(POINT_IN_TIME).first())
        .filter_map(|snak| snak.time_value())
        .filter_map(|time| years.recognize(&time.time))
        .collect();
    let mut ordered: Vec<String> = found.into_iter().map(str::to_string).collect();
    ordered.sort_by_key(|y| years.position(y));
    ordered
}

fn carries_legacy_reference(claim: &Claim, legacy_stated_in: u64) -> bool {
    let [reference] = claim.references.as_slice() else {
        return false;
    };
    let [stated_in] = reference.snaks_for(STATED_IN) else {
        return false;
    };
    reference.snaks.len() == 1 && stated_in.item_numeric_id() == Some(legacy_stated_in)
}

/// Replaces legacy references on claims created by earlier runs. Values and
/// qualifiers are left as they are; a year with zero or several candidates is skipped.
pub fn repair_references(
    entity: &RemoteEntity,
    area: &Area,
    applied: &[Change],
    config: &ReconcileConfig,
) -> Vec<Change> {
    let mut changes = Vec::new();
    for quantity in &config.quantities {
        let property = quantity.property.as_str();
        for year in applied_years(applied, property, &config.years) {
            if area.value(quantity.metric, &year).is_none() {
                continue;
            }
            let candidates: Vec<&Claim> = entity
                .claims_for(property)
                .iter()
                .filter(|claim| carries_legacy_reference(claim, config.legacy_stated_in))
                .filter(|claim| matches!(temporal(claim, &config.years), Temporal::Year(tagged, _) if tagged == year))
                .collect();
            match candidates.as_slice() {
                [claim] => {
                    let edit = ClaimEdit {
                        references: Some(quantity.references.clone()),
                        ..ClaimEdit::default()
                    };
                    changes.extend(Change::edit_claim(claim, edit));
                }
                other => {
                    debug!(entity = %entity.id, property, year = %year, candidates = other.len(), "no single claim to repair");
                }
            }
        }
    }
    changes
}
