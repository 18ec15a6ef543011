use serde::{Deserialize, Serialize};

/// Snapshot of the authenticated caller at the time a record was created.
///
/// Copied by value into every record; later changes to the user pool never
/// rewrite history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Identity {
    pub username: String,
    pub sub: String,
}

impl Identity {
    pub fn new(username: impl Into<String>, sub: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            sub: sub.into(),
        }
    }
}
