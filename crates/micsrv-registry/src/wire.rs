//! JSON bodies exchanged with the registry.
//!
//! Response fields the registry leaves out decode to their defaults, and a
//! `null` list is treated as empty.

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest<'a> {
    pub name: &'a str,
    pub srv: &'a str,
    pub proto: &'a str,
    pub version: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnregisterRequest<'a> {
    pub name: &'a str,
    pub proto: &'a str,
    pub srv: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegisterResponse {
    pub code: i64,
    pub msg: String,
    pub srv: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiscoverResponse {
    pub code: i64,
    pub msg: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub srvs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConfigResponse {
    pub code: i64,
    pub msg: String,
    pub yaml: String,
}

/// Body of `/micsrv/reload` and `/micsrv/unregister`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    pub code: i64,
    pub msg: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}
