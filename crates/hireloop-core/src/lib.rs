//! Core domain model for Hireloop: Loxo payload DTOs, local records and the
//! field rules shared by the sync pipeline and the stores.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hireloop-core";

/// Value written to `profiles.source` for records created by the Loxo sync.
pub const LOXO_SOURCE: &str = "loxo";

pub const PLACEHOLDER_EMAIL_DOMAIN: &str = "placeholder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    #[default]
    Contractor,
    Client,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Contractor => "CONTRACTOR",
            UserRole::Client => "CLIENT",
            UserRole::Admin => "ADMIN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CONTRACTOR" => Some(UserRole::Contractor),
            "CLIENT" => Some(UserRole::Client),
            "ADMIN" => Some(UserRole::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Lenient decoders for loosely-typed upstream JSON. A field that is absent,
// null, blank or of the wrong shape decodes to `None` rather than failing the
// whole page.

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) => non_blank(&s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite()))
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_i64(),
        Some(JsonValue::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    })
}

fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    let Some(JsonValue::Array(items)) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

fn lenient_person<'de, D>(deserializer: D) -> Result<Option<ExternalPerson>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContactEntry {
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: Option<String>,
}

/// Person embedded in a Loxo candidate record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalPerson {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub emails: Vec<ContactEntry>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub phones: Vec<ContactEntry>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub current_title: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub compensation: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub hourly_rate: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub rate: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub profile_picture_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub profile_picture_thumb_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExternalPerson {
    pub fn primary_email(&self) -> Option<String> {
        self.emails
            .iter()
            .filter_map(|e| e.value.as_deref())
            .find_map(non_blank)
            .map(|e| e.to_ascii_lowercase())
    }
}

/// Candidate as delivered by `GET /jobs/{id}/candidates`, annotated with the
/// job it was fetched for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalCandidate {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub workflow_stage_id: Option<i64>,
    /// `None` when absent or when the embedded record cannot be read (no id).
    #[serde(default, deserialize_with = "lenient_person")]
    pub person: Option<ExternalPerson>,
    #[serde(rename = "jobId", default)]
    pub job_id: Option<i64>,
    #[serde(rename = "jobTitle", default)]
    pub job_title: Option<String>,
    #[serde(rename = "jobPublishedName", default)]
    pub job_published_name: Option<String>,
}

impl ExternalCandidate {
    pub fn with_job(mut self, job: &LoxoJob) -> Self {
        self.job_id = Some(job.id);
        self.job_title = job.title.clone();
        self.job_published_name = job.published_name.clone();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoxoJob {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub published_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStage {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("workflow stage {name:?} not found (available: {available})")]
    NotFound { name: String, available: String },
}

/// Read-only view over the stage taxonomy fetched for a single run.
#[derive(Debug, Clone, Default)]
pub struct StageCatalog {
    stages: Vec<WorkflowStage>,
}

impl StageCatalog {
    pub fn new(stages: Vec<WorkflowStage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[WorkflowStage] {
        &self.stages
    }

    /// Names compare trimmed and case-insensitively.
    pub fn resolve(&self, name: &str) -> Result<&WorkflowStage, StageError> {
        resolve_stage(&self.stages, name)
    }
}

pub fn resolve_stage<'a>(
    stages: &'a [WorkflowStage],
    name: &str,
) -> Result<&'a WorkflowStage, StageError> {
    let wanted = name.trim();
    stages
        .iter()
        .find(|s| s.name.trim().eq_ignore_ascii_case(wanted))
        .ok_or_else(|| StageError::NotFound {
            name: wanted.to_string(),
            available: stages
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPerson {
    pub id: Uuid,
    pub loxo_person_id: Option<i64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub role: UserRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalPerson {
    /// Field-level merge of identity data. Returns whether anything changed.
    pub fn merge_identity(&mut self, incoming: &NewPerson) -> bool {
        let mut changed = false;
        changed |= merge_opt(&mut self.first_name, incoming.first_name.clone());
        changed |= merge_opt(&mut self.last_name, incoming.last_name.clone());
        if is_placeholder_email(&self.email)
            && !is_placeholder_email(&incoming.email)
            && self.email != incoming.email
        {
            self.email = incoming.email.clone();
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPerson {
    pub loxo_person_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub role: UserRole,
}

impl NewPerson {
    pub fn from_external(person: &ExternalPerson) -> Self {
        let (first_name, last_name) = split_full_name(person.name.as_deref());
        Self {
            loxo_person_id: person.id,
            first_name,
            last_name,
            email: person
                .primary_email()
                .unwrap_or_else(|| placeholder_email(person.id)),
            role: UserRole::Contractor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub country: Option<String>,
    pub role_types: Vec<String>,
    pub rate: Option<f64>,
    pub compensation: Option<f64>,
    pub source: Option<String>,
    pub current_title: Option<String>,
    pub profile_photo_url: Option<String>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalProfile {
    /// Last-non-null-wins per field. `is_blocked` is never touched by sync.
    pub fn merge(&mut self, incoming: &ProfileFields) -> bool {
        let mut changed = false;
        changed |= merge_opt(&mut self.country, incoming.country.clone());
        if !incoming.role_types.is_empty() && self.role_types != incoming.role_types {
            self.role_types = incoming.role_types.clone();
            changed = true;
        }
        changed |= merge_opt(&mut self.rate, incoming.rate);
        changed |= merge_opt(&mut self.compensation, incoming.compensation);
        changed |= merge_opt(&mut self.source, incoming.source.clone());
        changed |= merge_opt(&mut self.current_title, incoming.current_title.clone());
        changed |= merge_opt(
            &mut self.profile_photo_url,
            incoming.profile_photo_url.clone(),
        );
        changed |= merge_opt(&mut self.source_updated_at, incoming.source_updated_at);
        changed
    }
}

/// Mutable profile attributes carried by an incoming Loxo person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProfileFields {
    pub country: Option<String>,
    pub role_types: Vec<String>,
    pub rate: Option<f64>,
    pub compensation: Option<f64>,
    pub source: Option<String>,
    pub current_title: Option<String>,
    pub profile_photo_url: Option<String>,
    pub source_updated_at: Option<DateTime<Utc>>,
}

impl ProfileFields {
    pub fn from_external(person: &ExternalPerson) -> Self {
        Self {
            country: person.country.clone(),
            role_types: person.current_title.iter().cloned().collect(),
            rate: person.hourly_rate.or(person.rate),
            compensation: person.compensation,
            source: Some(LOXO_SOURCE.to_string()),
            current_title: person.current_title.clone(),
            profile_photo_url: person
                .profile_picture_url
                .clone()
                .or_else(|| person.profile_picture_thumb_url.clone()),
            source_updated_at: person.updated_at.or(person.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLink {
    pub id: Uuid,
    pub loxo_candidate_id: i64,
    pub loxo_job_id: i64,
    pub job_title: Option<String>,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJobLink {
    pub loxo_candidate_id: i64,
    pub loxo_job_id: i64,
    pub job_title: Option<String>,
    pub user_id: Uuid,
}

/// First whitespace token is the first name; the remaining tokens, joined by
/// single spaces, are the last name.
pub fn split_full_name(full_name: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(name) = full_name else {
        return (None, None);
    };
    let mut parts = name.split_whitespace();
    let first = parts.next().map(ToString::to_string);
    let rest = parts.collect::<Vec<_>>().join(" ");
    let last = if rest.is_empty() { None } else { Some(rest) };
    (first, last)
}

pub fn placeholder_email(loxo_person_id: i64) -> String {
    format!("noemail-{loxo_person_id}@{PLACEHOLDER_EMAIL_DOMAIN}")
}

pub fn is_placeholder_email(email: &str) -> bool {
    email.starts_with("noemail-") && email.ends_with(&format!("@{PLACEHOLDER_EMAIL_DOMAIN}"))
}

fn merge_opt<T: PartialEq>(current: &mut Option<T>, incoming: Option<T>) -> bool {
    match incoming {
        Some(value) if current.as_ref() != Some(&value) => {
            *current = Some(value);
            true
        }
        _ => false,
    }
}
