//! Item records and request/response shapes shared by every layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Prefix carried by ids assigned on the client before the server confirms.
pub const PROVISIONAL_ID_PREFIX: &str = "local-";

/// A remembered object and where it was put.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "userId")]
    pub user_id: Option<String>,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(alias = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Build a record with a client-assigned id, pending server confirmation.
    pub fn provisional(input: &CreateItemInput) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{PROVISIONAL_ID_PREFIX}{}", uuid::Uuid::new_v4()),
            name: input.name.clone(),
            location: input.location.clone(),
            user_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this record still carries a client-assigned id.
    pub fn is_provisional(&self) -> bool {
        is_provisional_id(&self.id)
    }

    /// Apply the fields of an update and bump `updated_at`.
    pub fn apply(&mut self, input: &UpdateItemInput) {
        if let Some(name) = &input.name {
            self.name = name.clone();
        }
        if let Some(location) = &input.location {
            self.location = location.clone();
        }
        self.updated_at = Utc::now();
    }

    /// Case-insensitive substring match on name or location.
    pub fn matches(&self, query: &str) -> bool {
        let needle = query.to_lowercase();
        self.name.to_lowercase().contains(&needle) || self.location.to_lowercase().contains(&needle)
    }
}

pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_ID_PREFIX)
}

/// Body of `POST /items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateItemInput {
    pub name: String,
    pub location: String,
}

impl CreateItemInput {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
        }
    }

    /// Trim both fields, rejecting empty values.
    pub fn validated(&self) -> Result<Self, SyncError> {
        Ok(Self {
            name: non_empty("name", &self.name)?,
            location: non_empty("location", &self.location)?,
        })
    }
}

/// Body of `PATCH /items/:id`; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateItemInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl UpdateItemInput {
    /// Trim present fields, rejecting empty values and empty updates.
    pub fn validated(&self) -> Result<Self, SyncError> {
        if self.name.is_none() && self.location.is_none() {
            return Err(SyncError::InvalidInput(
                "update must change name or location".to_string(),
            ));
        }
        Ok(Self {
            name: self
                .name
                .as_deref()
                .map(|n| non_empty("name", n))
                .transpose()?,
            location: self
                .location
                .as_deref()
                .map(|l| non_empty("location", l))
                .transpose()?,
        })
    }
}

fn non_empty(field: &str, value: &str) -> Result<String, SyncError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// An authenticated account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Response of `POST /auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    pub token_type: String,
    pub user: User,
}
