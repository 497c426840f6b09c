//! Persistence gateway for Loxo ingestion: users, profiles and job links.

use async_trait::async_trait;
use chrono::Utc;
use hireloop_core::{
    JobLink, LocalPerson, LocalProfile, NewJobLink, NewPerson, ProfileFields, UserRole,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hireloop-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("stored row is invalid: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err.as_database_error() {
            Some(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.constraint().unwrap_or("unique").to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

#[async_trait]
pub trait CandidateStore: Send + Sync {
    async fn find_job_link(
        &self,
        loxo_candidate_id: i64,
        loxo_job_id: i64,
    ) -> Result<Option<JobLink>, StoreError>;

    async fn find_job_link_for_person(
        &self,
        loxo_job_id: i64,
        loxo_candidate_id: i64,
        user_id: Uuid,
    ) -> Result<Option<JobLink>, StoreError>;

    async fn find_person(&self, id: Uuid) -> Result<Option<LocalPerson>, StoreError>;

    async fn find_person_by_loxo_id(
        &self,
        loxo_person_id: i64,
    ) -> Result<Option<LocalPerson>, StoreError>;

    async fn create_person(&self, person: &NewPerson) -> Result<LocalPerson, StoreError>;

    async fn update_person(&self, person: &LocalPerson) -> Result<LocalPerson, StoreError>;

    async fn find_profile(&self, user_id: Uuid) -> Result<Option<LocalProfile>, StoreError>;

    async fn create_profile(
        &self,
        user_id: Uuid,
        fields: &ProfileFields,
    ) -> Result<LocalProfile, StoreError>;

    async fn update_profile(&self, profile: &LocalProfile) -> Result<LocalProfile, StoreError>;

    /// Insert-if-absent keyed on `(loxo_candidate_id, loxo_job_id)`. Returns
    /// `None` when a link for that pair already exists.
    async fn create_job_link(&self, link: &NewJobLink) -> Result<Option<JobLink>, StoreError>;

    async fn list_job_links(&self) -> Result<Vec<JobLink>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    persons: Vec<LocalPerson>,
    profiles: Vec<LocalProfile>,
    links: Vec<JobLink>,
}

/// In-process store with the same unique constraints as the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryCandidateStore {
    state: Mutex<MemoryState>,
}

impl MemoryCandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn persons(&self) -> Vec<LocalPerson> {
        self.state.lock().await.persons.clone()
    }

    pub async fn profiles(&self) -> Vec<LocalProfile> {
        self.state.lock().await.profiles.clone()
    }
}

#[async_trait]
impl CandidateStore for MemoryCandidateStore {
    async fn find_job_link(
        &self,
        loxo_candidate_id: i64,
        loxo_job_id: i64,
    ) -> Result<Option<JobLink>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .iter()
            .find(|l| l.loxo_candidate_id == loxo_candidate_id && l.loxo_job_id == loxo_job_id)
            .cloned())
    }

    async fn find_job_link_for_person(
        &self,
        loxo_job_id: i64,
        loxo_candidate_id: i64,
        user_id: Uuid,
    ) -> Result<Option<JobLink>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .iter()
            .find(|l| {
                l.loxo_job_id == loxo_job_id
                    && l.loxo_candidate_id == loxo_candidate_id
                    && l.user_id == user_id
            })
            .cloned())
    }

    async fn find_person(&self, id: Uuid) -> Result<Option<LocalPerson>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.persons.iter().find(|p| p.id == id).cloned())
    }

    async fn find_person_by_loxo_id(
        &self,
        loxo_person_id: i64,
    ) -> Result<Option<LocalPerson>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .persons
            .iter()
            .find(|p| p.loxo_person_id == Some(loxo_person_id))
            .cloned())
    }

    async fn create_person(&self, person: &NewPerson) -> Result<LocalPerson, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .persons
            .iter()
            .any(|p| p.loxo_person_id == Some(person.loxo_person_id))
        {
            return Err(StoreError::Conflict("users_loxo_person_id_key".to_string()));
        }
        if state.persons.iter().any(|p| p.email == person.email) {
            return Err(StoreError::Conflict("users_email_key".to_string()));
        }
        let now = Utc::now();
        let created = LocalPerson {
            id: Uuid::new_v4(),
            loxo_person_id: Some(person.loxo_person_id),
            first_name: person.first_name.clone(),
            last_name: person.last_name.clone(),
            email: person.email.clone(),
            role: person.role,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        state.persons.push(created.clone());
        Ok(created)
    }

    async fn update_person(&self, person: &LocalPerson) -> Result<LocalPerson, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .persons
            .iter()
            .any(|p| p.id != person.id && p.email == person.email)
        {
            return Err(StoreError::Conflict("users_email_key".to_string()));
        }
        let stored = state
            .persons
            .iter_mut()
            .find(|p| p.id == person.id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", person.id)))?;
        *stored = LocalPerson {
            updated_at: Utc::now(),
            ..person.clone()
        };
        Ok(stored.clone())
    }

    async fn find_profile(&self, user_id: Uuid) -> Result<Option<LocalProfile>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.profiles.iter().find(|p| p.user_id == user_id).cloned())
    }

    async fn create_profile(
        &self,
        user_id: Uuid,
        fields: &ProfileFields,
    ) -> Result<LocalProfile, StoreError> {
        let mut state = self.state.lock().await;
        if !state.persons.iter().any(|p| p.id == user_id) {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        if state.profiles.iter().any(|p| p.user_id == user_id) {
            return Err(StoreError::Conflict("profiles_user_id_key".to_string()));
        }
        let now = Utc::now();
        let profile = LocalProfile {
            id: Uuid::new_v4(),
            user_id,
            country: fields.country.clone(),
            role_types: fields.role_types.clone(),
            rate: fields.rate,
            compensation: fields.compensation,
            source: fields.source.clone(),
            current_title: fields.current_title.clone(),
            profile_photo_url: fields.profile_photo_url.clone(),
            source_updated_at: fields.source_updated_at,
            is_blocked: false,
            created_at: now,
            updated_at: now,
        };
        state.profiles.push(profile.clone());
        Ok(profile)
    }

    async fn update_profile(&self, profile: &LocalProfile) -> Result<LocalProfile, StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .profiles
            .iter_mut()
            .find(|p| p.id == profile.id)
            .ok_or_else(|| StoreError::NotFound(format!("profile {}", profile.id)))?;
        *stored = LocalProfile {
            updated_at: Utc::now(),
            ..profile.clone()
        };
        Ok(stored.clone())
    }

    async fn create_job_link(&self, link: &NewJobLink) -> Result<Option<JobLink>, StoreError> {
        let mut state = self.state.lock().await;
        if !state.persons.iter().any(|p| p.id == link.user_id) {
            return Err(StoreError::NotFound(format!("user {}", link.user_id)));
        }
        if state.links.iter().any(|l| {
            l.loxo_candidate_id == link.loxo_candidate_id && l.loxo_job_id == link.loxo_job_id
        }) {
            return Ok(None);
        }
        let created = JobLink {
            id: Uuid::new_v4(),
            loxo_candidate_id: link.loxo_candidate_id,
            loxo_job_id: link.loxo_job_id,
            job_title: link.job_title.clone(),
            user_id: link.user_id,
            created_at: Utc::now(),
        };
        state.links.push(created.clone());
        Ok(Some(created))
    }

    async fn list_job_links(&self) -> Result<Vec<JobLink>, StoreError> {
        Ok(self.state.lock().await.links.clone())
    }
}

const PERSON_COLUMNS: &str =
    "id, loxo_person_id, first_name, last_name, email, role, is_active, created_at, updated_at";

const PROFILE_COLUMNS: &str = "id, user_id, country, role_types, rate, compensation, source, \
     current_title, profile_photo_url, source_updated_at, is_blocked, created_at, updated_at";

const LINK_COLUMNS: &str = "id, loxo_candidate_id, loxo_job_id, job_title, user_id, created_at";

#[derive(Debug, Clone)]
pub struct PgCandidateStore {
    pool: PgPool,
}

impl PgCandidateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn person_from_row(row: &PgRow) -> Result<LocalPerson, StoreError> {
    let role: String = row.try_get("role")?;
    Ok(LocalPerson {
        id: row.try_get("id")?,
        loxo_person_id: row.try_get("loxo_person_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email: row.try_get("email")?,
        role: UserRole::parse(&role)
            .ok_or_else(|| StoreError::Decode(format!("unknown user role {role:?}")))?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn profile_from_row(row: &PgRow) -> Result<LocalProfile, StoreError> {
    Ok(LocalProfile {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        country: row.try_get("country")?,
        role_types: row.try_get("role_types")?,
        rate: row.try_get("rate")?,
        compensation: row.try_get("compensation")?,
        source: row.try_get("source")?,
        current_title: row.try_get("current_title")?,
        profile_photo_url: row.try_get("profile_photo_url")?,
        source_updated_at: row.try_get("source_updated_at")?,
        is_blocked: row.try_get("is_blocked")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn link_from_row(row: &PgRow) -> Result<JobLink, StoreError> {
    Ok(JobLink {
        id: row.try_get("id")?,
        loxo_candidate_id: row.try_get("loxo_candidate_id")?,
        loxo_job_id: row.try_get("loxo_job_id")?,
        job_title: row.try_get("job_title")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl CandidateStore for PgCandidateStore {
    async fn find_job_link(
        &self,
        loxo_candidate_id: i64,
        loxo_job_id: i64,
    ) -> Result<Option<JobLink>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM loxo_jobs WHERE loxo_candidate_id = $1 AND loxo_job_id = $2"
        ))
        .bind(loxo_candidate_id)
        .bind(loxo_job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn find_job_link_for_person(
        &self,
        loxo_job_id: i64,
        loxo_candidate_id: i64,
        user_id: Uuid,
    ) -> Result<Option<JobLink>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {LINK_COLUMNS}
              FROM loxo_jobs
             WHERE loxo_job_id = $1
               AND loxo_candidate_id = $2
               AND user_id = $3
            "#
        ))
        .bind(loxo_job_id)
        .bind(loxo_candidate_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn find_person(&self, id: Uuid) -> Result<Option<LocalPerson>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PERSON_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(person_from_row).transpose()
    }

    async fn find_person_by_loxo_id(
        &self,
        loxo_person_id: i64,
    ) -> Result<Option<LocalPerson>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PERSON_COLUMNS} FROM users WHERE loxo_person_id = $1"
        ))
        .bind(loxo_person_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(person_from_row).transpose()
    }

    async fn create_person(&self, person: &NewPerson) -> Result<LocalPerson, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO users (id, loxo_person_id, first_name, last_name, email, role, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE)
            RETURNING {PERSON_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(person.loxo_person_id)
        .bind(&person.first_name)
        .bind(&person.last_name)
        .bind(&person.email)
        .bind(person.role.as_str())
        .fetch_one(&self.pool)
        .await?;
        person_from_row(&row)
    }

    async fn update_person(&self, person: &LocalPerson) -> Result<LocalPerson, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE users
               SET first_name = $2,
                   last_name = $3,
                   email = $4,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {PERSON_COLUMNS}
            "#
        ))
        .bind(person.id)
        .bind(&person.first_name)
        .bind(&person.last_name)
        .bind(&person.email)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("user {}", person.id)))?;
        person_from_row(&row)
    }

    async fn find_profile(&self, user_id: Uuid) -> Result<Option<LocalProfile>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn create_profile(
        &self,
        user_id: Uuid,
        fields: &ProfileFields,
    ) -> Result<LocalProfile, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO profiles (
                id, user_id, country, role_types, rate, compensation, source,
                current_title, profile_photo_url, source_updated_at, is_blocked
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE)
            RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&fields.country)
        .bind(&fields.role_types)
        .bind(fields.rate)
        .bind(fields.compensation)
        .bind(&fields.source)
        .bind(&fields.current_title)
        .bind(&fields.profile_photo_url)
        .bind(fields.source_updated_at)
        .fetch_one(&self.pool)
        .await?;
        profile_from_row(&row)
    }

    async fn update_profile(&self, profile: &LocalProfile) -> Result<LocalProfile, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE profiles
               SET country = $2,
                   role_types = $3,
                   rate = $4,
                   compensation = $5,
                   source = $6,
                   current_title = $7,
                   profile_photo_url = $8,
                   source_updated_at = $9,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(profile.id)
        .bind(&profile.country)
        .bind(&profile.role_types)
        .bind(profile.rate)
        .bind(profile.compensation)
        .bind(&profile.source)
        .bind(&profile.current_title)
        .bind(&profile.profile_photo_url)
        .bind(profile.source_updated_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("profile {}", profile.id)))?;
        profile_from_row(&row)
    }

    async fn create_job_link(&self, link: &NewJobLink) -> Result<Option<JobLink>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO loxo_jobs (id, loxo_candidate_id, loxo_job_id, job_title, user_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (loxo_candidate_id, loxo_job_id) DO NOTHING
            RETURNING {LINK_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(link.loxo_candidate_id)
        .bind(link.loxo_job_id)
        .bind(&link.job_title)
        .bind(link.user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn list_job_links(&self) -> Result<Vec<JobLink>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM loxo_jobs ORDER BY created_at, loxo_job_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(link_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_person(loxo_id: i64, email: &str) -> NewPerson {
        NewPerson {
            loxo_person_id: loxo_id,
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            email: email.to_string(),
            role: UserRole::Contractor,
        }
    }

    #[tokio::test]
    async fn memory_store_enforces_user_uniqueness() {
        let store = MemoryCandidateStore::new();
        store
            .create_person(&new_person(100, "ada@example.com"))
            .await
            .expect("first person");

        let dup_loxo = store.create_person(&new_person(100, "other@example.com")).await;
        assert!(matches!(dup_loxo, Err(StoreError::Conflict(_))));

        let dup_email = store.create_person(&new_person(101, "ada@example.com")).await;
        assert!(matches!(dup_email, Err(StoreError::Conflict(_))));

        let found = store.find_person_by_loxo_id(100).await.unwrap().expect("person");
        assert_eq!(found.email, "ada@example.com");
        assert_eq!(store.persons().await.len(), 1);
    }

    #[tokio::test]
    async fn job_link_insert_is_insert_if_absent() {
        let store = MemoryCandidateStore::new();
        let person = store
            .create_person(&new_person(100, "ada@example.com"))
            .await
            .unwrap();
        let link = NewJobLink {
            loxo_candidate_id: 1,
            loxo_job_id: 10,
            job_title: Some("Bookkeeper".into()),
            user_id: person.id,
        };

        let first = store.create_job_link(&link).await.unwrap();
        assert!(first.is_some());
        let second = store.create_job_link(&link).await.unwrap();
        assert!(second.is_none());

        assert!(store.find_job_link(1, 10).await.unwrap().is_some());
        assert!(store
            .find_job_link_for_person(10, 1, person.id)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_job_link_for_person(10, 1, Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.list_job_links().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn profile_is_one_to_one_and_updatable() {
        let store = MemoryCandidateStore::new();
        let person = store
            .create_person(&new_person(100, "ada@example.com"))
            .await
            .unwrap();
        let fields = ProfileFields {
            country: Some("US".into()),
            ..Default::default()
        };
        let mut profile = store.create_profile(person.id, &fields).await.unwrap();
        assert!(!profile.is_blocked);
        assert!(matches!(
            store.create_profile(person.id, &fields).await,
            Err(StoreError::Conflict(_))
        ));

        profile.compensation = Some(5000.0);
        store.update_profile(&profile).await.unwrap();
        let stored = store.find_profile(person.id).await.unwrap().expect("profile");
        assert_eq!(stored.compensation, Some(5000.0));
        assert_eq!(stored.country.as_deref(), Some("US"));
    }

    #[tokio::test]
    async fn links_require_an_existing_user() {
        let store = MemoryCandidateStore::new();
        let err = store
            .create_job_link(&NewJobLink {
                loxo_candidate_id: 1,
                loxo_job_id: 1,
                job_title: None,
                user_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn pg_store_links_are_idempotent_when_database_available() {
        let Ok(url) = std::env::var("HIRELOOP_TEST_DATABASE_URL") else {
            return;
        };
        let store = PgCandidateStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");

        let loxo_id = (Utc::now().timestamp_micros() % 1_000_000_000) + 1_000_000_000;
        let person = store
            .create_person(&new_person(loxo_id, &format!("pg-{loxo_id}@example.com")))
            .await
            .expect("person");
        let link = NewJobLink {
            loxo_candidate_id: loxo_id,
            loxo_job_id: 1,
            job_title: None,
            user_id: person.id,
        };
        assert!(store.create_job_link(&link).await.unwrap().is_some());
        assert!(store.create_job_link(&link).await.unwrap().is_none());
    }
}
