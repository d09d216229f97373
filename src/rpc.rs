//! Catalog of supported RPCs.
//!
//! Every RPC the facade forwards must be listed here. A call is resolved by
//! name, its parameters are checked against the declared types, and only then
//! is it handed to the transport. Names and parameter keys may be written with
//! underscores or dashes (`get_interface_information` and
//! `get-interface-information` are the same RPC).

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DeviceError;

/// RPC parameters: parameter name to JSON value.
pub type RpcParams = serde_json::Map<String, Value>;

/// Built-in RPC names supported by this crate.
pub const BUILTIN_RPCS: &[&str] = &[
    "get-software-information",
    "get-interface-information",
    "get-route-information",
    "get-chassis-inventory",
    "get-system-uptime-information",
    "get-configuration",
    "get-lldp-neighbors-information",
    "get-alarm-information",
    "ping",
];

static RPC_NAME: Lazy<Regex> = Lazy::new(|| match Regex::new(r"^[a-z][a-z0-9_-]*$") {
    Ok(re) => re,
    Err(err) => panic!("invalid RPC_NAME regex: {err}"),
});

/// Value type of an RPC parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Str,
    Bool,
    UInt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

/// Metadata for a catalog RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RpcMetadata {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

fn param(name: &str, kind: ParamKind, required: bool) -> ParamSpec {
    ParamSpec {
        name: name.to_string(),
        kind,
        required,
    }
}

fn metadata_for(name: &str) -> Option<RpcMetadata> {
    let (description, params) = match name {
        "get-software-information" => ("Software version and model", vec![]),
        "get-interface-information" => (
            "Interface state and counters",
            vec![
                param("interface-name", ParamKind::Str, false),
                param("terse", ParamKind::Bool, false),
                param("detail", ParamKind::Bool, false),
            ],
        ),
        "get-route-information" => (
            "Routing table entries",
            vec![
                param("destination", ParamKind::Str, false),
                param("table", ParamKind::Str, false),
            ],
        ),
        "get-chassis-inventory" => (
            "Hardware inventory",
            vec![param("detail", ParamKind::Bool, false)],
        ),
        "get-system-uptime-information" => ("Boot and configuration times", vec![]),
        "get-configuration" => (
            "Configuration database contents",
            vec![
                param("format", ParamKind::Str, false),
                param("database", ParamKind::Str, false),
            ],
        ),
        "get-lldp-neighbors-information" => ("LLDP neighbors", vec![]),
        "get-alarm-information" => ("Active chassis alarms", vec![]),
        "ping" => (
            "ICMP echo from the device",
            vec![
                param("host", ParamKind::Str, true),
                param("count", ParamKind::UInt, false),
                param("rapid", ParamKind::Bool, false),
            ],
        ),
        _ => return None,
    };
    Some(RpcMetadata {
        name: name.to_string(),
        description: description.to_string(),
        params,
    })
}

/// Returns names of all built-in RPCs.
pub fn available_rpcs() -> &'static [&'static str] {
    BUILTIN_RPCS
}

/// Returns metadata for all built-in RPCs.
pub fn rpc_catalog() -> Vec<RpcMetadata> {
    BUILTIN_RPCS
        .iter()
        .filter_map(|name| metadata_for(name))
        .collect()
}

/// Canonical (dashed, lowercase) spelling of an RPC or parameter name.
pub fn canonical_name(name: &str) -> Result<String, DeviceError> {
    let lowered = name.trim().to_ascii_lowercase();
    if !RPC_NAME.is_match(&lowered) {
        return Err(DeviceError::InvalidArgument(format!(
            "malformed name '{name}'"
        )));
    }
    Ok(lowered.replace('_', "-"))
}

/// Returns metadata for one RPC by name.
pub fn rpc_metadata(name: &str) -> Result<RpcMetadata, DeviceError> {
    let key = canonical_name(name).map_err(|_| DeviceError::UnsupportedRpc(name.to_string()))?;
    metadata_for(&key).ok_or_else(|| DeviceError::UnsupportedRpc(name.to_string()))
}

/// Resolves an RPC call against the catalog.
///
/// Returns the canonical RPC name and parameters with canonical keys, ready
/// for the transport.
pub fn prepare(name: &str, params: &RpcParams) -> Result<(String, RpcParams), DeviceError> {
    let meta = rpc_metadata(name)?;
    let mut prepared = RpcParams::new();

    for (key, value) in params {
        let key = canonical_name(key)?;
        let spec = meta.params.iter().find(|p| p.name == key).ok_or_else(|| {
            DeviceError::InvalidArgument(format!("{} does not accept parameter '{key}'", meta.name))
        })?;
        if !value_matches(spec.kind, value) {
            return Err(DeviceError::InvalidArgument(format!(
                "{} parameter '{key}' must be {:?}",
                meta.name, spec.kind
            )));
        }
        prepared.insert(key, value.clone());
    }

    for spec in meta.params.iter().filter(|p| p.required) {
        if !prepared.contains_key(&spec.name) {
            return Err(DeviceError::InvalidArgument(format!(
                "{} requires parameter '{}'",
                meta.name, spec.name
            )));
        }
    }

    check_values(&meta.name, &prepared)?;
    Ok((meta.name, prepared))
}

fn value_matches(kind: ParamKind, value: &Value) -> bool {
    match kind {
        ParamKind::Str => value.is_string(),
        ParamKind::Bool => value.is_boolean(),
        ParamKind::UInt => value.is_u64(),
    }
}

// Per-RPC value rules that a type alone cannot express.
fn check_values(name: &str, params: &RpcParams) -> Result<(), DeviceError> {
    match name {
        "ping" => {
            if params.get("count").and_then(Value::as_u64) == Some(0) {
                return Err(DeviceError::InvalidArgument(
                    "ping count must be at least 1".to_string(),
                ));
            }
            if params
                .get("host")
                .and_then(Value::as_str)
                .is_some_and(|h| h.trim().is_empty())
            {
                return Err(DeviceError::InvalidArgument(
                    "ping host is empty".to_string(),
                ));
            }
        }
        "get-configuration" => {
            if let Some(format) = params.get("format").and_then(Value::as_str)
                && !matches!(format, "text" | "xml" | "set" | "json")
            {
                return Err(DeviceError::InvalidArgument(format!(
                    "get-configuration format '{format}' is not supported"
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> RpcParams {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    #[test]
    fn catalog_covers_all_builtin_names() {
        let catalog = rpc_catalog();
        assert_eq!(catalog.len(), BUILTIN_RPCS.len());
        assert_eq!(available_rpcs(), BUILTIN_RPCS);
    }

    #[test]
    fn underscore_names_resolve_to_dashed() {
        let (name, prepared) = prepare(
            "get_interface_information",
            &params(json!({"interface_name": "ge-0/0/0", "terse": true})),
        )
        .expect("prepare rpc");
        assert_eq!(name, "get-interface-information");
        assert_eq!(prepared.get("interface-name"), Some(&json!("ge-0/0/0")));
        assert_eq!(prepared.get("terse"), Some(&json!(true)));
    }

    #[test]
    fn unknown_rpc_is_unsupported() {
        let err = prepare("request-system-zeroize", &RpcParams::new()).expect_err("unknown rpc");
        assert!(matches!(err, DeviceError::UnsupportedRpc(_)));
        assert_eq!(err.to_string(), "unsupported RPC: request-system-zeroize");
    }

    #[test]
    fn malformed_rpc_name_is_unsupported() {
        let err = rpc_metadata("__getattr__()").expect_err("malformed");
        assert!(matches!(err, DeviceError::UnsupportedRpc(_)));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let err = prepare(
            "get-software-information",
            &params(json!({"brief": true})),
        )
        .expect_err("unknown param");
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn wrong_parameter_type_is_rejected() {
        let err = prepare("ping", &params(json!({"host": "10.0.0.2", "count": "five"})))
            .expect_err("wrong type");
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let err = prepare("ping", &params(json!({"count": 3}))).expect_err("missing host");
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn zero_ping_count_is_rejected() {
        let err = prepare("ping", &params(json!({"host": "10.0.0.2", "count": 0})))
            .expect_err("zero count");
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn configuration_format_is_checked() {
        assert!(prepare("get-configuration", &params(json!({"format": "set"}))).is_ok());
        assert!(prepare("get-configuration", &params(json!({"format": "yaml"}))).is_err());
    }
}
