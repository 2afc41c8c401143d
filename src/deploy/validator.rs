//! Compose definition validation
//!
//! Validation happens before anything touches Docker: YAML safety,
//! required fields, per-service shape checks and dependency analysis.
//! The result carries the topological startup order.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComposeError {
    #[error("Unsafe YAML: {0}")]
    Unsafe(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),
}

/// A parsed and validated compose document.
#[derive(Debug, Clone)]
pub struct ValidatedCompose {
    doc: Value,
    /// Service names in dependency-respecting startup order.
    pub startup_order: Vec<String>,
    /// Top-level `networks:` names.
    pub declared_networks: Vec<String>,
    /// Top-level `volumes:` names (auto-created with driver local).
    pub declared_volumes: Vec<String>,
}

impl ValidatedCompose {
    pub fn service(&self, name: &str) -> Option<&Value> {
        self.doc.get("services")?.get(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.startup_order.clone()
    }
}

/// Tags that would make a loader execute code. Compose files never need
/// YAML tags at all, so any explicit tag is rejected.
fn check_yaml_safety(text: &str) -> Result<(), ComposeError> {
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            continue;
        }
        if let Some(pos) = line.find("!!") {
            let tag: String = line[pos..]
                .chars()
                .take_while(|c| !c.is_whitespace())
                .collect();
            // Core scalar tags (!!str, !!int, ...) are harmless; object
            // and executable tags are not.
            if tag.starts_with("!!python")
                || tag.starts_with("!!java")
                || tag.starts_with("!!ruby")
                || tag.contains("/object")
                || tag.contains("/name")
                || tag.contains("/apply")
            {
                return Err(ComposeError::Unsafe(format!("executable tag {tag}")));
            }
        }
    }
    Ok(())
}

/// Validate a compose definition end to end.
pub fn validate_compose(text: &str) -> Result<ValidatedCompose, ComposeError> {
    check_yaml_safety(text)?;

    let doc: Value = serde_yaml::from_str(text)
        .map_err(|e| ComposeError::Validation(format!("invalid YAML: {e}")))?;

    if doc.get("version").is_none() {
        return Err(ComposeError::MissingField("version"));
    }

    let services = doc
        .get("services")
        .ok_or(ComposeError::MissingField("services"))?;
    let services = services
        .as_mapping()
        .ok_or_else(|| ComposeError::Validation("'services' must be a mapping".into()))?;
    if services.is_empty() {
        return Err(ComposeError::Validation(
            "At least one service required".into(),
        ));
    }

    let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let names: HashSet<String> = services
        .keys()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect();

    for (name_value, service) in services {
        let name = name_value
            .as_str()
            .ok_or_else(|| ComposeError::Validation("service names must be strings".into()))?;

        validate_service(name, service)?;
        deps.insert(name.to_string(), service_dependencies(name, service, &names)?);
    }

    let startup_order = topological_order(&deps)?;

    Ok(ValidatedCompose {
        declared_networks: mapping_keys(doc.get("networks")),
        declared_volumes: mapping_keys(doc.get("volumes")),
        doc,
        startup_order,
    })
}

fn mapping_keys(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_mapping)
        .map(|m| {
            m.keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn validate_service(name: &str, service: &Value) -> Result<(), ComposeError> {
    let service_map = service
        .as_mapping()
        .ok_or_else(|| ComposeError::Validation(format!("Service '{name}' must be a mapping")))?;

    if !service_map.contains_key("image") && !service_map.contains_key("build") {
        return Err(ComposeError::Validation(format!(
            "Service '{name}' must have 'image' or 'build'"
        )));
    }

    // Port mapping shapes.
    if let Some(ports) = service.get("ports") {
        let ports = ports.as_sequence().ok_or_else(|| {
            ComposeError::Validation(format!("Service '{name}': 'ports' must be a list"))
        })?;
        for port in ports {
            match port {
                Value::String(s) => validate_port_string(name, s)?,
                Value::Number(_) => {}
                Value::Mapping(_) => {} // long syntax
                _ => {
                    return Err(ComposeError::Validation(format!(
                        "Service '{name}': invalid port entry"
                    )))
                }
            }
        }
    }

    // network_mode is a non-empty string and excludes networks.
    if let Some(mode) = service.get("network_mode") {
        let mode = mode.as_str().unwrap_or_default();
        if mode.is_empty() {
            return Err(ComposeError::Validation(format!(
                "Service '{name}': 'network_mode' must be a non-empty string"
            )));
        }
        if service.get("networks").is_some() {
            return Err(ComposeError::Validation(format!(
                "Service '{name}': 'network_mode' and 'networks' are mutually exclusive"
            )));
        }
    }

    // devices must be a list; a bare string is the classic mistake.
    if let Some(devices) = service.get("devices") {
        if !devices.is_sequence() {
            return Err(ComposeError::Validation(format!(
                "Service '{name}': 'devices' must be a list"
            )));
        }
    }

    // extra_hosts accepts the list and the map form, nothing else.
    if let Some(extra) = service.get("extra_hosts") {
        if !extra.is_sequence() && !extra.is_mapping() {
            return Err(ComposeError::Validation(format!(
                "Service '{name}': 'extra_hosts' must be a list or a mapping"
            )));
        }
    }

    Ok(())
}

fn validate_port_string(service: &str, spec: &str) -> Result<(), ComposeError> {
    let bad = || {
        ComposeError::Validation(format!(
            "Service '{service}': invalid port mapping '{spec}'"
        ))
    };

    let without_proto = spec.split('/').next().unwrap_or_default();
    if without_proto.is_empty() {
        return Err(bad());
    }

    // Accept "80", "8080:80" and "127.0.0.1:8080:80".
    let parts: Vec<&str> = without_proto.split(':').collect();
    let port_parts: &[&str] = match parts.len() {
        1 => &parts[..],
        2 => &parts[..],
        3 => &parts[1..],
        _ => return Err(bad()),
    };

    for part in port_parts {
        // Host part may be a range "8080-8090".
        for piece in part.split('-') {
            if piece.parse::<u16>().is_err() {
                return Err(bad());
            }
        }
    }
    Ok(())
}

fn service_dependencies(
    name: &str,
    service: &Value,
    known: &HashSet<String>,
) -> Result<Vec<String>, ComposeError> {
    let Some(depends) = service.get("depends_on") else {
        return Ok(Vec::new());
    };

    let listed: Vec<String> = match depends {
        Value::Sequence(seq) => seq
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::Mapping(map) => map
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect(),
        _ => {
            return Err(ComposeError::Validation(format!(
                "Service '{name}': 'depends_on' must be a list or a mapping"
            )))
        }
    };

    for dep in &listed {
        if dep == name {
            return Err(ComposeError::DependencyCycle(format!(
                "Service '{name}' depends on itself"
            )));
        }
        if !known.contains(dep) {
            return Err(ComposeError::Validation(format!(
                "Service '{name}' depends on unknown service '{dep}'"
            )));
        }
    }

    Ok(listed)
}

/// Kahn's algorithm; dependencies start before their dependents. A
/// leftover node means a cycle.
fn topological_order(deps: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>, ComposeError> {
    // In-degree counts a service's unsatisfied dependencies.
    let mut in_degree: HashMap<&str, usize> = deps
        .iter()
        .map(|(name, listed)| (name.as_str(), listed.len()))
        .collect();

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(deps.len());
    while let Some(next) = ready.pop() {
        order.push(next.to_string());
        // Every service depending on `next` loses one unsatisfied edge.
        let mut newly_ready: Vec<&str> = Vec::new();
        for (name, listed) in deps {
            if listed.iter().any(|d| d == next) {
                let Some(degree) = in_degree.get_mut(name.as_str()) else {
                    continue;
                };
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(name.as_str());
                }
            }
        }
        newly_ready.sort_unstable();
        ready.extend(newly_ready);
        ready.sort_unstable();
        ready.dedup();
    }

    if order.len() != deps.len() {
        let stuck: Vec<&str> = deps
            .keys()
            .map(String::as_str)
            .filter(|n| !order.iter().any(|o| o == n))
            .collect();
        return Err(ComposeError::DependencyCycle(format!(
            "cycle involving: {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_python_object_tags() {
        let dangerous = r#"
version: '3.8'
services:
  web:
    image: !!python/object/apply:os.system ['echo hacked']
"#;
        assert!(matches!(
            validate_compose(dangerous),
            Err(ComposeError::Unsafe(_))
        ));
    }

    #[test]
    fn test_accepts_safe_yaml() {
        let safe = r#"
version: '3.8'
services:
  web:
    image: nginx:latest
    environment:
      NODE_ENV: production
"#;
        let validated = validate_compose(safe).unwrap();
        assert_eq!(validated.startup_order, vec!["web"]);
    }

    #[test]
    fn test_version_required() {
        let compose = "services:\n  web:\n    image: nginx\n";
        assert!(matches!(
            validate_compose(compose),
            Err(ComposeError::MissingField("version"))
        ));
    }

    #[test]
    fn test_services_required_and_non_empty() {
        assert!(matches!(
            validate_compose("version: '3'\n"),
            Err(ComposeError::MissingField("services"))
        ));
        assert!(matches!(
            validate_compose("version: '3'\nservices: {}\n"),
            Err(ComposeError::Validation(msg)) if msg.contains("At least one service")
        ));
    }

    #[test]
    fn test_service_needs_image_or_build() {
        let compose = r#"
version: '3'
services:
  web:
    ports: ["80:80"]
"#;
        assert!(matches!(
            validate_compose(compose),
            Err(ComposeError::Validation(msg)) if msg.contains("'web' must have 'image' or 'build'")
        ));

        let with_build = r#"
version: '3'
services:
  web:
    build: .
"#;
        assert!(validate_compose(with_build).is_ok());
    }

    #[test]
    fn test_port_shapes() {
        let good = r#"
version: '3'
services:
  web:
    image: nginx
    ports:
      - "80"
      - "8080:80"
      - "127.0.0.1:8443:443"
      - "9000:9000/udp"
"#;
        assert!(validate_compose(good).is_ok());

        let bad = r#"
version: '3'
services:
  web:
    image: nginx
    ports: ["http:80"]
"#;
        assert!(matches!(
            validate_compose(bad),
            Err(ComposeError::Validation(msg)) if msg.contains("invalid port mapping")
        ));
    }

    #[test]
    fn test_network_mode_rules() {
        let empty = r#"
version: '3'
services:
  web:
    image: nginx
    network_mode: ''
"#;
        assert!(matches!(
            validate_compose(empty),
            Err(ComposeError::Validation(msg)) if msg.contains("non-empty")
        ));

        let both = r#"
version: '3'
services:
  web:
    image: nginx
    network_mode: host
    networks: [backend]
"#;
        assert!(matches!(
            validate_compose(both),
            Err(ComposeError::Validation(msg)) if msg.contains("mutually exclusive")
        ));
    }

    #[test]
    fn test_devices_must_be_list() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    devices: '/dev/snd:/dev/snd'
"#;
        assert!(matches!(
            validate_compose(compose),
            Err(ComposeError::Validation(msg)) if msg.contains("'devices' must be a list")
        ));
    }

    #[test]
    fn test_extra_hosts_forms() {
        let list_form = r#"
version: '3'
services:
  web:
    image: nginx
    extra_hosts: ["db:10.0.0.5"]
"#;
        assert!(validate_compose(list_form).is_ok());

        let map_form = r#"
version: '3'
services:
  web:
    image: nginx
    extra_hosts:
      db: 10.0.0.5
"#;
        assert!(validate_compose(map_form).is_ok());

        let bad = r#"
version: '3'
services:
  web:
    image: nginx
    extra_hosts: "db:10.0.0.5"
"#;
        assert!(validate_compose(bad).is_err());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    depends_on: [web]
"#;
        assert!(matches!(
            validate_compose(compose),
            Err(ComposeError::DependencyCycle(msg)) if msg.contains("depends on itself")
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    depends_on: [db]
"#;
        assert!(matches!(
            validate_compose(compose),
            Err(ComposeError::Validation(msg)) if msg.contains("unknown service 'db'")
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let compose = r#"
version: '3'
services:
  a:
    image: x
    depends_on: [b]
  b:
    image: y
    depends_on: [a]
"#;
        assert!(matches!(
            validate_compose(compose),
            Err(ComposeError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_startup_order_respects_dependencies() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    depends_on: [api]
  api:
    image: api
    depends_on: [db]
  db:
    image: postgres
"#;
        let validated = validate_compose(compose).unwrap();
        let order = validated.startup_order;
        let pos = |n: &str| order.iter().position(|s| s == n).unwrap();
        assert!(pos("db") < pos("api"));
        assert!(pos("api") < pos("web"));
    }

    #[test]
    fn test_declared_networks_and_volumes() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
networks:
  backend: {}
volumes:
  data: {}
"#;
        let validated = validate_compose(compose).unwrap();
        assert_eq!(validated.declared_networks, vec!["backend"]);
        assert_eq!(validated.declared_volumes, vec!["data"]);
    }
}
