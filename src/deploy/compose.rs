//! Service definition to container configuration mapping

use std::collections::HashMap;

use bollard::container::Config;
use bollard::models::{DeviceMapping, HealthConfig, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use serde_yaml::Value;

use super::validator::ComposeError;

/// Everything the executor needs to create one service's container.
#[derive(Debug, Clone)]
pub struct ServicePlan {
    pub service_name: String,
    pub container_name: String,
    pub image: String,
    pub config: Config<String>,
    /// Named volumes this service mounts; auto-created when absent.
    pub named_volumes: Vec<String>,
    /// Networks requested via `networks:`; validated against the host
    /// with bridge fallback at execution time.
    pub networks: Vec<String>,
}

/// Parse `512m` / `1g` / `1073741824` into bytes.
pub fn parse_memory(raw: &str) -> Option<i64> {
    let raw = raw.trim().to_lowercase();
    if let Ok(bytes) = raw.parse::<i64>() {
        return Some(bytes);
    }
    let (number, multiplier) = raw.split_at(raw.len().checked_sub(1)?);
    let multiplier: i64 = match multiplier {
        "b" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return None,
    };
    let value: f64 = number.parse().ok()?;
    Some((value * multiplier as f64) as i64)
}

fn parse_cpus(value: &Value) -> Option<i64> {
    let cpus = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    Some((cpus * 1_000_000_000.0) as i64)
}

/// `30s` / `1m30s` / `500ms` to nanoseconds for HEALTHCHECK fields.
fn parse_duration_ns(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let mut total: i64 = 0;
    let mut number = String::new();
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let mut unit = c.to_string();
        if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            unit.push('s');
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        let ns = match unit.as_str() {
            "h" => value * 3_600_000_000_000.0,
            "m" => value * 60_000_000_000.0,
            "s" => value * 1_000_000_000.0,
            "ms" => value * 1_000_000.0,
            _ => return None,
        };
        total += ns as i64;
    }
    if !number.is_empty() {
        // A bare number means seconds.
        total += (number.parse::<f64>().ok()? * 1_000_000_000.0) as i64;
    }
    Some(total)
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(seq) => seq
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// `environment:` accepts `KEY: value` maps and `KEY=value` lists.
fn environment_list(value: Option<&Value>) -> Option<Vec<String>> {
    let value = value?;
    match value {
        Value::Sequence(seq) => Some(
            seq.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        Value::Mapping(map) => Some(
            map.iter()
                .filter_map(|(k, v)| {
                    let key = k.as_str()?;
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        Value::Null => String::new(),
                        _ => return None,
                    };
                    Some(format!("{key}={rendered}"))
                })
                .collect(),
        ),
        _ => None,
    }
}

/// `extra_hosts:` list (`host:ip`) or map (`host: ip`) to the flat form
/// Docker wants.
fn extra_hosts_list(value: Option<&Value>) -> Option<Vec<String>> {
    let value = value?;
    match value {
        Value::Sequence(_) => Some(string_list(value)),
        Value::Mapping(map) => Some(
            map.iter()
                .filter_map(|(k, v)| Some(format!("{}:{}", k.as_str()?, v.as_str()?)))
                .collect(),
        ),
        _ => None,
    }
}

fn labels_map(value: Option<&Value>) -> HashMap<String, String> {
    match value {
        Some(Value::Mapping(map)) => map
            .iter()
            .filter_map(|(k, v)| {
                Some((k.as_str()?.to_string(), v.as_str().unwrap_or_default().to_string()))
            })
            .collect(),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| {
                let (key, val) = v.as_str()?.split_once('=').unwrap_or((v.as_str()?, ""));
                Some((key.to_string(), val.to_string()))
            })
            .collect(),
        _ => HashMap::new(),
    }
}

/// Resource limits with v3 precedence: `deploy.resources` overrides the
/// v2 `mem_limit` / `cpus` shorthand when both appear.
fn resources(service: &Value) -> (Option<i64>, Option<i64>, Option<i64>) {
    let mut memory = service
        .get("mem_limit")
        .and_then(|v| match v {
            Value::String(s) => parse_memory(s),
            Value::Number(n) => n.as_i64(),
            _ => None,
        });
    let mut nano_cpus = service.get("cpus").and_then(parse_cpus);
    let mut memory_reservation = None;

    if let Some(limits) = service
        .get("deploy")
        .and_then(|d| d.get("resources"))
        .and_then(|r| r.get("limits"))
    {
        if let Some(mem) = limits.get("memory").and_then(|v| v.as_str()) {
            memory = parse_memory(mem);
        }
        if let Some(cpus) = limits.get("cpus") {
            nano_cpus = parse_cpus(cpus);
        }
    }
    if let Some(reservations) = service
        .get("deploy")
        .and_then(|d| d.get("resources"))
        .and_then(|r| r.get("reservations"))
    {
        if let Some(mem) = reservations.get("memory").and_then(|v| v.as_str()) {
            memory_reservation = parse_memory(mem);
        }
    }

    (memory, nano_cpus, memory_reservation)
}

fn restart_policy(service: &Value) -> Option<RestartPolicy> {
    let name = match service.get("restart").and_then(|v| v.as_str())? {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        _ => return None,
    };
    Some(RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    })
}

fn healthcheck(service: &Value) -> Option<HealthConfig> {
    let hc = service.get("healthcheck")?;
    let test = match hc.get("test")? {
        Value::String(s) => vec!["CMD-SHELL".to_string(), s.clone()],
        value => string_list(value),
    };
    Some(HealthConfig {
        test: Some(test),
        interval: hc
            .get("interval")
            .and_then(|v| v.as_str())
            .and_then(parse_duration_ns),
        timeout: hc
            .get("timeout")
            .and_then(|v| v.as_str())
            .and_then(parse_duration_ns),
        retries: hc.get("retries").and_then(|v| v.as_i64()),
        start_period: hc
            .get("start_period")
            .and_then(|v| v.as_str())
            .and_then(parse_duration_ns),
        ..Default::default()
    })
}

fn devices(service: &Value) -> Option<Vec<DeviceMapping>> {
    let listed = string_list(service.get("devices")?);
    if listed.is_empty() {
        return None;
    }
    Some(
        listed
            .iter()
            .map(|spec| {
                let mut parts = spec.splitn(3, ':');
                let host = parts.next().unwrap_or_default().to_string();
                let container = parts.next().unwrap_or(&host).to_string();
                let permissions = parts.next().unwrap_or("rwm").to_string();
                DeviceMapping {
                    path_on_host: Some(host),
                    path_in_container: Some(container),
                    cgroup_permissions: Some(permissions),
                }
            })
            .collect(),
    )
}

/// Split `volumes:` entries into binds (host paths) and named volumes.
fn volumes(service: &Value) -> (Vec<String>, Vec<String>) {
    let mut binds = Vec::new();
    let mut named = Vec::new();

    for entry in service
        .get("volumes")
        .map(string_list)
        .unwrap_or_default()
    {
        let source = entry.split(':').next().unwrap_or_default();
        if source.starts_with('/') || source.starts_with("./") || source.starts_with("~/") {
            binds.push(entry);
        } else if !source.is_empty() {
            named.push(source.to_string());
            binds.push(entry);
        }
    }
    (binds, named)
}

fn port_maps(
    service: &Value,
) -> (
    Option<HashMap<String, Option<Vec<PortBinding>>>>,
    Option<HashMap<String, HashMap<(), ()>>>,
) {
    let Some(ports) = service.get("ports") else {
        return (None, None);
    };

    let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();

    for entry in string_list(ports) {
        let (spec, protocol) = entry
            .split_once('/')
            .map(|(s, p)| (s.to_string(), p.to_string()))
            .unwrap_or((entry.clone(), "tcp".to_string()));

        let parts: Vec<&str> = spec.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [container] => (None, None, container.to_string()),
            [host, container] => (None, Some(host.to_string()), container.to_string()),
            [ip, host, container] => (
                Some(ip.to_string()),
                Some(host.to_string()),
                container.to_string(),
            ),
            _ => continue,
        };

        let key = format!("{container_port}/{protocol}");
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip,
                host_port,
            }]),
        );
    }

    (Some(bindings), Some(exposed))
}

/// Map one validated service to a container configuration.
///
/// `extra_labels` carries the deployment-management labels the executor
/// stamps on everything it creates.
pub fn service_to_config(
    service_name: &str,
    service: &Value,
    project_name: &str,
    extra_labels: &HashMap<String, String>,
) -> Result<ServicePlan, ComposeError> {
    let image = service
        .get("image")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ComposeError::Validation(format!(
                "Service '{service_name}': deployment requires 'image' (build is not supported here)"
            ))
        })?
        .to_string();

    let container_name = service
        .get("container_name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{project_name}-{service_name}"));

    let (memory, nano_cpus, memory_reservation) = resources(service);
    let (binds, named_volumes) = volumes(service);
    let (port_bindings, exposed_ports) = port_maps(service);

    let mut labels = labels_map(service.get("labels"));
    labels.insert(
        "com.docker.compose.project".to_string(),
        project_name.to_string(),
    );
    labels.insert(
        "com.docker.compose.service".to_string(),
        service_name.to_string(),
    );
    labels.extend(extra_labels.clone());

    let network_mode = service
        .get("network_mode")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let networks = service
        .get("networks")
        .map(|v| match v {
            Value::Mapping(map) => map
                .keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect(),
            other => string_list(other),
        })
        .unwrap_or_default();

    let host_config = HostConfig {
        binds: if binds.is_empty() { None } else { Some(binds) },
        port_bindings,
        memory,
        memory_reservation,
        nano_cpus,
        network_mode: network_mode.clone(),
        restart_policy: restart_policy(service),
        cap_add: service.get("cap_add").map(string_list),
        cap_drop: service.get("cap_drop").map(string_list),
        devices: devices(service),
        extra_hosts: extra_hosts_list(service.get("extra_hosts")),
        ..Default::default()
    };

    let config = Config {
        image: Some(image.clone()),
        env: environment_list(service.get("environment")),
        cmd: service.get("command").map(string_list),
        labels: Some(labels),
        exposed_ports,
        healthcheck: healthcheck(service),
        host_config: Some(host_config),
        ..Default::default()
    };

    Ok(ServicePlan {
        service_name: service_name.to_string(),
        container_name,
        image,
        config,
        named_volumes,
        networks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::validator::validate_compose;

    fn plan_for(compose: &str, service: &str) -> ServicePlan {
        let validated = validate_compose(compose).unwrap();
        service_to_config(
            service,
            validated.service(service).unwrap(),
            "proj",
            &HashMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_memory_units() {
        assert_eq!(parse_memory("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory("1073741824"), Some(1073741824));
        assert_eq!(parse_memory("2.5g"), Some((2.5 * 1024.0 * 1024.0 * 1024.0) as i64));
        assert_eq!(parse_memory("lots"), None);
    }

    #[test]
    fn test_v3_limits_override_v2() {
        let compose = r#"
version: '3.8'
services:
  web:
    image: nginx
    mem_limit: 256m
    cpus: 0.5
    deploy:
      resources:
        limits:
          memory: 512m
          cpus: '1.5'
        reservations:
          memory: 128m
"#;
        let plan = plan_for(compose, "web");
        let hc = plan.config.host_config.unwrap();
        assert_eq!(hc.memory, Some(512 * 1024 * 1024));
        assert_eq!(hc.nano_cpus, Some(1_500_000_000));
        assert_eq!(hc.memory_reservation, Some(128 * 1024 * 1024));
    }

    #[test]
    fn test_v2_limits_used_alone() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    mem_limit: 256m
    cpus: 0.5
"#;
        let plan = plan_for(compose, "web");
        let hc = plan.config.host_config.unwrap();
        assert_eq!(hc.memory, Some(256 * 1024 * 1024));
        assert_eq!(hc.nano_cpus, Some(500_000_000));
    }

    #[test]
    fn test_environment_both_forms() {
        let map_form = r#"
version: '3'
services:
  web:
    image: nginx
    environment:
      A: one
      B: 2
"#;
        let mut env = plan_for(map_form, "web").config.env.unwrap();
        env.sort();
        assert_eq!(env, vec!["A=one", "B=2"]);

        let list_form = r#"
version: '3'
services:
  web:
    image: nginx
    environment:
      - A=one
      - B=2
"#;
        let mut env = plan_for(list_form, "web").config.env.unwrap();
        env.sort();
        assert_eq!(env, vec!["A=one", "B=2"]);
    }

    #[test]
    fn test_extra_hosts_both_forms() {
        let list_form = r#"
version: '3'
services:
  web:
    image: nginx
    extra_hosts: ["db:10.0.0.5"]
"#;
        let hc = plan_for(list_form, "web").config.host_config.unwrap();
        assert_eq!(hc.extra_hosts.unwrap(), vec!["db:10.0.0.5"]);

        let map_form = r#"
version: '3'
services:
  web:
    image: nginx
    extra_hosts:
      db: 10.0.0.5
"#;
        let hc = plan_for(map_form, "web").config.host_config.unwrap();
        assert_eq!(hc.extra_hosts.unwrap(), vec!["db:10.0.0.5"]);
    }

    #[test]
    fn test_volumes_split_bind_vs_named() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    volumes:
      - /host/config:/etc/nginx:ro
      - data:/var/lib/data
volumes:
  data: {}
"#;
        let plan = plan_for(compose, "web");
        assert_eq!(plan.named_volumes, vec!["data"]);
        let binds = plan.config.host_config.unwrap().binds.unwrap();
        assert_eq!(binds.len(), 2);
        assert!(binds.contains(&"/host/config:/etc/nginx:ro".to_string()));
    }

    #[test]
    fn test_devices_mapping() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    devices:
      - /dev/snd:/dev/snd
      - /dev/dri
"#;
        let hc = plan_for(compose, "web").config.host_config.unwrap();
        let devices = hc.devices.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].path_on_host.as_deref(), Some("/dev/snd"));
        assert_eq!(devices[1].path_in_container.as_deref(), Some("/dev/dri"));
        assert_eq!(devices[0].cgroup_permissions.as_deref(), Some("rwm"));
    }

    #[test]
    fn test_healthcheck_durations() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    healthcheck:
      test: ["CMD", "curl", "-f", "http://localhost/"]
      interval: 30s
      timeout: 5s
      retries: 3
      start_period: 1m
"#;
        let hc = plan_for(compose, "web").config.healthcheck.unwrap();
        assert_eq!(hc.interval, Some(30_000_000_000));
        assert_eq!(hc.timeout, Some(5_000_000_000));
        assert_eq!(hc.retries, Some(3));
        assert_eq!(hc.start_period, Some(60_000_000_000));
    }

    #[test]
    fn test_string_healthcheck_becomes_cmd_shell() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    healthcheck:
      test: curl -f http://localhost/
"#;
        let hc = plan_for(compose, "web").config.healthcheck.unwrap();
        assert_eq!(hc.test.unwrap()[0], "CMD-SHELL");
    }

    #[test]
    fn test_compose_labels_stamped() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
"#;
        let labels = plan_for(compose, "web").config.labels.unwrap();
        assert_eq!(labels["com.docker.compose.project"], "proj");
        assert_eq!(labels["com.docker.compose.service"], "web");
    }

    #[test]
    fn test_ports_mapped() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    ports:
      - "127.0.0.1:8443:443"
      - "9000:9000/udp"
"#;
        let plan = plan_for(compose, "web");
        let hc = plan.config.host_config.unwrap();
        let bindings = hc.port_bindings.unwrap();
        let https = bindings["443/tcp"].as_ref().unwrap();
        assert_eq!(https[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(https[0].host_port.as_deref(), Some("8443"));
        assert!(bindings.contains_key("9000/udp"));
    }

    #[test]
    fn test_restart_policy() {
        let compose = r#"
version: '3'
services:
  web:
    image: nginx
    restart: unless-stopped
"#;
        let hc = plan_for(compose, "web").config.host_config.unwrap();
        assert_eq!(
            hc.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
    }
}
