//! Discovered service endpoints
//!
//! This module provides:
//! - The `Endpoint` model emitted by observers
//! - `EndpointEvent`, the add/remove stream consumed by the monitor manager
//! - The discovery rule engine used to bind monitor configs to endpoints

pub mod rules;

use rules::RuleValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Transport protocol of an endpoint's port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortType {
    Tcp,
    Udp,
    #[default]
    Unknown,
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortType::Tcp => write!(f, "TCP"),
            PortType::Udp => write!(f, "UDP"),
            PortType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Container runtime metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    pub names: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub state: String,
}

/// Orchestrator metadata (pods, tasks)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationInfo {
    pub pod_name: Option<String>,
    pub pod_uid: Option<String>,
    pub namespace: Option<String>,
    pub node_name: Option<String>,
    pub task_id: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// A discovered network service instance. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable for the life of the underlying service
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub port_type: PortType,
    pub port_name: Option<String>,
    /// Name of the observer that found it
    pub discovered_by: String,
    pub container: Option<ContainerInfo>,
    pub orchestration: Option<OrchestrationInfo>,
    /// User-supplied labels
    pub labels: BTreeMap<String, String>,
    /// Dimensions added to every datapoint of monitors bound to this endpoint
    pub dimensions: BTreeMap<String, String>,
    /// Observer-specific fields exposed to discovery rules
    pub extra_fields: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        discovered_by: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host: String::new(),
            port: 0,
            port_type: PortType::Unknown,
            port_name: None,
            discovered_by: discovered_by.into(),
            container: None,
            orchestration: None,
            labels: BTreeMap::new(),
            dimensions: BTreeMap::new(),
            extra_fields: BTreeMap::new(),
        }
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16, port_type: PortType) -> Self {
        self.host = host.into();
        self.port = port;
        self.port_type = port_type;
        self
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    /// Dimensions merged into monitor output for this endpoint
    pub fn output_dimensions(&self) -> HashMap<String, String> {
        let mut dims: HashMap<String, String> = self
            .dimensions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(c) = &self.container {
            dims.insert("container_id".to_string(), c.id.clone());
            dims.insert("container_image".to_string(), c.image.clone());
            if let Some(name) = c.names.first() {
                dims.insert(
                    "container_name".to_string(),
                    name.trim_start_matches('/').to_string(),
                );
            }
        }
        if let Some(o) = &self.orchestration {
            if let Some(pod) = &o.pod_name {
                dims.insert("kubernetes_pod_name".to_string(), pod.clone());
            }
            if let Some(ns) = &o.namespace {
                dims.insert("kubernetes_namespace".to_string(), ns.clone());
            }
            if let Some(uid) = &o.pod_uid {
                dims.insert("kubernetes_pod_uid".to_string(), uid.clone());
            }
        }
        dims
    }

    fn is_ip_address(&self) -> bool {
        self.host.parse::<std::net::IpAddr>().is_ok()
    }

    /// Variable map that discovery rules evaluate against. Every snake_case
    /// key is also available in lowerCamelCase.
    pub fn rule_variables(&self) -> HashMap<String, RuleValue> {
        let mut vars: HashMap<String, RuleValue> = HashMap::new();

        for (k, v) in &self.extra_fields {
            vars.insert(k.clone(), RuleValue::Str(v.clone()));
        }
        for (k, v) in &self.dimensions {
            vars.insert(k.clone(), RuleValue::Str(v.clone()));
        }

        vars.insert("id".into(), RuleValue::Str(self.id.clone()));
        vars.insert("name".into(), RuleValue::Str(self.name.clone()));
        vars.insert("host".into(), RuleValue::Str(self.host.clone()));
        vars.insert("port".into(), RuleValue::Num(f64::from(self.port)));
        vars.insert("network_port".into(), RuleValue::Str(self.port.to_string()));
        vars.insert("port_type".into(), RuleValue::Str(self.port_type.to_string()));
        vars.insert(
            "discovered_by".into(),
            RuleValue::Str(self.discovered_by.clone()),
        );
        if let Some(port_name) = &self.port_name {
            vars.insert("port_name".into(), RuleValue::Str(port_name.clone()));
        }
        if self.is_ip_address() {
            vars.insert("ip_address".into(), RuleValue::Str(self.host.clone()));
        }

        let mut all_labels: BTreeMap<String, RuleValue> = BTreeMap::new();

        if let Some(c) = &self.container {
            let labels = string_map(&c.labels);
            vars.insert("container_id".into(), RuleValue::Str(c.id.clone()));
            vars.insert("container_image".into(), RuleValue::Str(c.image.clone()));
            vars.insert("container_state".into(), RuleValue::Str(c.state.clone()));
            if let Some(name) = c.names.first() {
                vars.insert(
                    "container_name".into(),
                    RuleValue::Str(name.trim_start_matches('/').to_string()),
                );
            }
            vars.insert(
                "container_names".into(),
                RuleValue::List(c.names.iter().cloned().map(RuleValue::Str).collect()),
            );
            vars.insert("container_labels".into(), RuleValue::Map(labels.clone()));

            let mut nested = BTreeMap::new();
            nested.insert("id".to_string(), RuleValue::Str(c.id.clone()));
            nested.insert("image".to_string(), RuleValue::Str(c.image.clone()));
            nested.insert("state".to_string(), RuleValue::Str(c.state.clone()));
            nested.insert("labels".to_string(), RuleValue::Map(labels.clone()));
            vars.insert("container".into(), RuleValue::Map(nested));

            all_labels.extend(labels);
        }

        if let Some(o) = &self.orchestration {
            let opt = |v: &Option<String>| v.clone().map(RuleValue::Str);
            for (key, value) in [
                ("pod_name", opt(&o.pod_name)),
                ("pod_uid", opt(&o.pod_uid)),
                ("namespace", opt(&o.namespace)),
                ("node_name", opt(&o.node_name)),
                ("task_id", opt(&o.task_id)),
            ] {
                if let Some(value) = value {
                    vars.insert(key.to_string(), value);
                }
            }
            let labels = string_map(&o.labels);
            vars.insert("pod_labels".into(), RuleValue::Map(labels.clone()));
            all_labels.extend(labels);
        }

        all_labels.extend(string_map(&self.labels));
        vars.insert("labels".into(), RuleValue::Map(all_labels));

        duplicate_keys_as_camel_case(vars)
    }
}

fn string_map(m: &BTreeMap<String, String>) -> BTreeMap<String, RuleValue> {
    m.iter()
        .map(|(k, v)| (k.clone(), RuleValue::Str(v.clone())))
        .collect()
}

fn duplicate_keys_as_camel_case(vars: HashMap<String, RuleValue>) -> HashMap<String, RuleValue> {
    let mut out = vars.clone();
    for (k, v) in vars {
        if k.contains('_') {
            out.entry(to_lower_camel(&k)).or_insert(v);
        }
    }
    out
}

fn to_lower_camel(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper_next = false;
    for c in s.chars() {
        if c == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Endpoint discovery stream item
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    Added(Endpoint),
    Removed(String),
}

impl EndpointEvent {
    pub fn endpoint_id(&self) -> &str {
        match self {
            EndpointEvent::Added(ep) => &ep.id,
            EndpointEvent::Removed(id) => id,
        }
    }
}
