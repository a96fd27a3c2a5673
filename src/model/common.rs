use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type WorkspaceId = i64;
pub type ResponseId = i64;
pub type JobId = i64;
pub type CoderId = i64;
pub type BundleId = i64;

/// A coding variable, identified by the unit it belongs to and its variable id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableRef {
    pub unit_name: String,
    pub variable_id: String,
}

impl VariableRef {
    pub fn new(unit_name: impl Into<String>, variable_id: impl Into<String>) -> Self {
        Self {
            unit_name: unit_name.into(),
            variable_id: variable_id.into(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}_{}", self.unit_name, self.variable_id)
    }
}

/// A named group of variables that is allocated as one selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableBundle {
    pub id: BundleId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub variables: Vec<VariableRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coder {
    pub id: CoderId,
    pub name: String,
}

impl Coder {
    /// `name (id)`; names alone are not unique
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }
}

pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// SHA-256 over the given parts, sorted first so the digest does not depend on input order
pub fn order_independent_hash<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    use sha2::{Digest, Sha256};

    let mut sorted: Vec<String> = parts.into_iter().map(|p| p.as_ref().to_string()).collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for part in &sorted {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }

    hex::encode(hasher.finalize())
}
