use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct User {
    pub username: String,
    #[serde(skip_serializing, default)]
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    /// `None` until the password is changed for the first time.
    pub password_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateUserParams {
    pub username: String,
    pub hashed_password: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
}

/// Hook run inside the user-creation transaction. An error rolls the user back.
pub type AfterCreateUser = Box<dyn FnOnce(&User) -> crate::error::Result<()> + Send>;

pub struct CreateUserTxParams {
    pub params: CreateUserParams,
    pub after_create: AfterCreateUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserTxResult {
    pub user: User,
}
