//! Desired-state validation.
//!
//! Every check runs before the store writes anything; a failure becomes
//! `StateError::Invalid` and the caller is told synchronously.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{StateError, StateResult};
use crate::types::*;

static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid DNS label pattern")
});

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").expect("valid env name pattern"));

fn invalid(msg: impl Into<String>) -> StateError {
    StateError::Invalid(msg.into())
}

/// Names must be DNS labels: they end up inside member and service addresses.
pub fn validate_name(what: &str, name: &str) -> StateResult<()> {
    if name.len() > 63 || !DNS_LABEL.is_match(name) {
        return Err(invalid(format!(
            "{what} name {name:?} must be a lowercase DNS label of at most 63 characters"
        )));
    }
    Ok(())
}

pub fn validate_workload(spec: &WorkloadSpec) -> StateResult<()> {
    validate_name("workload", &spec.name)?;

    if spec.image.trim().is_empty() {
        return Err(invalid(format!("workload {}: image must not be empty", spec.name)));
    }
    if spec.ports.contains(&0) {
        return Err(invalid(format!("workload {}: port 0 is not allowed", spec.name)));
    }

    match (&spec.kind, &spec.volume) {
        (WorkloadKind::Stateless, Some(_)) => {
            return Err(invalid(format!(
                "workload {}: volumes are only supported on stateful workloads",
                spec.name
            )));
        }
        (WorkloadKind::Stateful, Some(v)) if v.size_bytes == 0 => {
            return Err(invalid(format!(
                "workload {}: volume size must be greater than zero",
                spec.name
            )));
        }
        _ => {}
    }

    if spec.max_unavailable == Some(0) {
        return Err(invalid(format!(
            "workload {}: max_unavailable must be at least 1",
            spec.name
        )));
    }

    for (key, value) in &spec.env {
        if !ENV_NAME.is_match(key) {
            return Err(invalid(format!(
                "workload {}: invalid environment variable name {key:?}",
                spec.name
            )));
        }
        if let EnvValue::Secret { secret_ref } = value {
            if secret_ref.name.is_empty() || secret_ref.key.is_empty() {
                return Err(invalid(format!(
                    "workload {}: secret reference for {key} needs both name and key",
                    spec.name
                )));
            }
        }
    }

    if let Some(metrics) = &spec.metrics {
        if metrics.port == Some(0) || metrics.interval_secs == Some(0) {
            return Err(invalid(format!(
                "workload {}: metrics port and interval must be non-zero",
                spec.name
            )));
        }
        if metrics.path.as_deref().is_some_and(|p| !p.starts_with('/')) {
            return Err(invalid(format!(
                "workload {}: metrics path must start with '/'",
                spec.name
            )));
        }
    }

    Ok(())
}

/// Reject changes to fields that are fixed at creation.
pub fn validate_workload_update(new: &WorkloadSpec, previous: &WorkloadSpec) -> StateResult<()> {
    let changed = new.immutable_changes(previous);
    if !changed.is_empty() {
        return Err(invalid(format!(
            "workload {}: immutable field(s) changed: {}",
            new.name,
            changed.join(", ")
        )));
    }
    Ok(())
}

/// `target` is the workload the service points at, if it exists.
pub fn validate_service(svc: &ServiceRecord, target: Option<&WorkloadSpec>) -> StateResult<()> {
    validate_name("service", &svc.name)?;

    if svc.external_port == 0 || svc.target_port == 0 {
        return Err(invalid(format!("service {}: ports must be non-zero", svc.name)));
    }

    let Some(workload) = target else {
        return Err(invalid(format!(
            "service {}: workload {:?} does not exist",
            svc.name, svc.workload
        )));
    };

    if !workload.ports.is_empty() && !workload.ports.contains(&svc.target_port) {
        return Err(invalid(format!(
            "service {}: target port {} is not exposed by workload {}",
            svc.name, svc.target_port, workload.name
        )));
    }

    Ok(())
}

pub fn validate_ingress(rule: &IngressRule, service_exists: bool) -> StateResult<()> {
    validate_name("ingress", &rule.name)?;

    if rule.host.trim().is_empty() {
        return Err(invalid(format!("ingress {}: host must not be empty", rule.name)));
    }
    if !rule.path_prefix.starts_with('/') {
        return Err(invalid(format!(
            "ingress {}: path prefix must start with '/'",
            rule.name
        )));
    }
    if rule.port == 0 {
        return Err(invalid(format!("ingress {}: port must be non-zero", rule.name)));
    }
    if !service_exists {
        return Err(invalid(format!(
            "ingress {}: service {:?} does not exist",
            rule.name, rule.service
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn web() -> WorkloadSpec {
        WorkloadSpec {
            name: "nodejs-app".to_string(),
            kind: WorkloadKind::Stateless,
            replicas: 2,
            image: "nodejs-app:v1".to_string(),
            ports: BTreeSet::from([3000]),
            env: BTreeMap::new(),
            volume: None,
            max_unavailable: None,
            metrics: None,
            generation: 0,
        }
    }

    #[test]
    fn accepts_valid_workload() {
        assert!(validate_workload(&web()).is_ok());
    }

    #[test]
    fn rejects_bad_names() {
        let long = "a".repeat(64);
        for name in ["", "Web", "-web", "web-", "web_app", long.as_str()] {
            let mut spec = web();
            spec.name = name.to_string();
            assert!(
                matches!(validate_workload(&spec), Err(StateError::Invalid(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_volume_on_stateless() {
        let mut spec = web();
        spec.volume = Some(VolumeRequest { size_bytes: 1024 });
        let err = validate_workload(&spec).unwrap_err();
        assert!(err.to_string().contains("stateful"));
    }

    #[test]
    fn rejects_incomplete_secret_ref() {
        let mut spec = web();
        spec.env.insert(
            "TOKEN".to_string(),
            EnvValue::Secret {
                secret_ref: SecretRef {
                    name: "api".to_string(),
                    key: String::new(),
                },
            },
        );
        assert!(validate_workload(&spec).is_err());
    }

    #[test]
    fn service_must_target_exposed_port() {
        let svc = ServiceRecord {
            name: "nodejs-app-service".to_string(),
            mode: ServiceMode::LoadBalanced,
            workload: "nodejs-app".to_string(),
            external_port: 80,
            target_port: 8080,
        };
        assert!(validate_service(&svc, Some(&web())).is_err());
        assert!(validate_service(&svc, None).is_err());

        let svc = ServiceRecord { target_port: 3000, ..svc };
        assert!(validate_service(&svc, Some(&web())).is_ok());
    }

    #[test]
    fn ingress_prefix_must_be_absolute() {
        let rule = IngressRule {
            name: "web".to_string(),
            host: "nodejs-app.local".to_string(),
            path_prefix: "api".to_string(),
            service: "nodejs-app-service".to_string(),
            port: 80,
            seq: 0,
        };
        assert!(validate_ingress(&rule, true).is_err());

        let rule = IngressRule { path_prefix: "/api".to_string(), ..rule };
        assert!(validate_ingress(&rule, true).is_ok());
        assert!(validate_ingress(&rule, false).is_err());
    }
}
