//! Types shared by the Dex and DexClient CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Coarse lifecycle state shared by both resource kinds
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    /// Never observed by a controller
    #[default]
    Uninitialized,
    /// Observed, first convergence in progress
    Initialising,
    /// Converged and serving
    Active,
    /// Last pass failed; see `message`
    Failing,
}

impl Phase {
    /// String form as it appears in status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Initialising => "Initialising",
            Self::Active => "Active",
            Self::Failing => "Failing",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schema for free-form JSON objects that the API server must store as-is
pub(crate) fn preserve_unknown_fields(
    _gen: &mut schemars::gen::SchemaGenerator,
) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(schema)
}
