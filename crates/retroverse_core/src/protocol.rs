//! Request and response bodies of the main and long-poll endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;
use crate::permissions::PermissionSnapshot;
use crate::schema::DataDictionary;
use crate::wire::CondensedDaton;

/// Subscription level requested for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SubscribeState {
    #[default]
    Unsubscribed,
    Subscribed,
    /// Subscribed and locked for editing
    Locked,
}

impl TryFrom<u8> for SubscribeState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SubscribeState::Unsubscribed),
            1 => Ok(SubscribeState::Subscribed),
            2 => Ok(SubscribeState::Locked),
            other => Err(format!("invalid subscribe state {}", other)),
        }
    }
}

impl From<SubscribeState> for u8 {
    fn from(state: SubscribeState) -> Self {
        match state {
            SubscribeState::Unsubscribed => 0,
            SubscribeState::Subscribed => 1,
            SubscribeState::Locked => 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    #[serde(default)]
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDatonRequest {
    pub key: String,
    #[serde(default)]
    pub do_subscribe: bool,
    #[serde(default)]
    pub force_load: bool,
    /// Version the client already holds; the daton is omitted when current
    #[serde(default)]
    pub known_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageDatonRequest {
    pub key: String,
    pub subscribe_state: SubscribeState,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainRequest {
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub initialize: Option<InitializeRequest>,
    #[serde(default)]
    pub get_datons: Vec<GetDatonRequest>,
    #[serde(default)]
    pub manage_datons: Vec<ManageDatonRequest>,
    /// Persiston diffs in wire form
    #[serde(default)]
    pub save_datons: Vec<Value>,
    #[serde(default)]
    pub do_quit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageDatonResult {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub subscribe_state: SubscribeState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedPersiston {
    pub old_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_key: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl SavedPersiston {
    pub fn failed(old_key: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            old_key: old_key.into(),
            new_key: None,
            success: false,
            errors,
            is_deleted: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dictionary: Option<DataDictionary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionSnapshot>,
    #[serde(default)]
    pub condensed_datons: Vec<CondensedDaton>,
    #[serde(default)]
    pub manage_datons: Vec<ManageDatonResult>,
    #[serde(default)]
    pub saved_persistons: Vec<SavedPersiston>,
    #[serde(default)]
    pub save_persistons_success: bool,
}

impl MainResponse {
    pub fn error(code: ErrorCode) -> Self {
        Self {
            error_code: Some(code),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongPollRequest {
    pub session_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongPollResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub condensed_datons: Vec<CondensedDaton>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionSnapshot>,
}

impl LongPollResponse {
    pub fn error(code: ErrorCode) -> Self {
        Self {
            error_code: Some(code),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.condensed_datons.is_empty() && self.permissions.is_none()
    }
}
