//! Ingress router — maps external `(host, path)` requests to services.
//!
//! Hosts match exactly (case-insensitive, any `:port` suffix ignored).
//! Among rules for the host, the longest path prefix wins, matched on
//! whole path segments: `/api` matches `/api` and `/api/v1` but not
//! `/apix`. Ties go to the rule registered first.

use std::sync::RwLock;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use topo_state::IngressRule;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no ingress rule matches {host}{path}")]
    NotFound { host: String, path: String },
}

/// Where an external request goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub rule: String,
    pub service: String,
    pub port: u16,
}

#[derive(Default)]
pub struct IngressRouter {
    /// Sorted by registration order.
    rules: RwLock<Vec<IngressRule>>,
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
        _ => host,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn normalize_prefix(prefix: &str) -> &str {
    match prefix.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// Segment-aware prefix match.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

impl IngressRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole rule set.
    pub fn replace_rules(&self, mut rules: Vec<IngressRule>) {
        rules.sort_by_key(|r| r.seq);
        debug!(rules = rules.len(), "ingress rules replaced");
        *self.rules.write().expect("ingress lock") = rules;
    }

    /// Insert or update one rule, keeping registration order.
    pub fn upsert(&self, rule: IngressRule) {
        let mut rules = self.rules.write().expect("ingress lock");
        rules.retain(|r| r.name != rule.name);
        rules.push(rule);
        rules.sort_by_key(|r| r.seq);
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut rules = self.rules.write().expect("ingress lock");
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    pub fn rules(&self) -> Vec<IngressRule> {
        self.rules.read().expect("ingress lock").clone()
    }

    pub fn route(&self, host: &str, path: &str) -> Result<Route, RouteError> {
        let wanted_host = normalize_host(host);
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let path = if path.is_empty() { "/" } else { path };

        let rules = self.rules.read().expect("ingress lock");
        let mut best: Option<(&IngressRule, usize)> = None;
        for rule in rules.iter() {
            if normalize_host(&rule.host) != wanted_host {
                continue;
            }
            let prefix = normalize_prefix(&rule.path_prefix);
            if !prefix_matches(prefix, path) {
                continue;
            }
            // Strictly longer only: earlier rules win ties.
            if best.is_none_or(|(_, len)| prefix.len() > len) {
                best = Some((rule, prefix.len()));
            }
        }

        match best {
            Some((rule, _)) => Ok(Route {
                rule: rule.name.clone(),
                service: rule.service.clone(),
                port: rule.port,
            }),
            None => Err(RouteError::NotFound {
                host: host.to_string(),
                path: path.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, host: &str, prefix: &str, service: &str, seq: u64) -> IngressRule {
        IngressRule {
            name: name.to_string(),
            host: host.to_string(),
            path_prefix: prefix.to_string(),
            service: service.to_string(),
            port: 80,
            seq,
        }
    }

    fn router(rules: Vec<IngressRule>) -> IngressRouter {
        let router = IngressRouter::new();
        router.replace_rules(rules);
        router
    }

    #[test]
    fn routes_root_rule_for_any_path() {
        let router = router(vec![rule(
            "app",
            "nodejs-app.local",
            "/",
            "nodejs-app-service",
            1,
        )]);
        let route = router.route("nodejs-app.local", "/").unwrap();
        assert_eq!(route.service, "nodejs-app-service");
        assert_eq!(route.port, 80);
        assert!(router.route("nodejs-app.local", "/deep/path?x=1").is_ok());
    }

    #[test]
    fn host_match_ignores_case_and_port() {
        let router = router(vec![rule("app", "nodejs-app.local", "/", "svc", 1)]);
        assert!(router.route("NodeJS-App.Local:8080", "/").is_ok());
        assert!(router.route("other.local", "/").is_err());
        assert!(router.route("sub.nodejs-app.local", "/").is_err());
    }

    #[test]
    fn longest_segment_prefix_wins() {
        let router = router(vec![
            rule("root", "a.local", "/", "web", 1),
            rule("api", "a.local", "/api", "api", 2),
            rule("api-v2", "a.local", "/api/v2/", "api-v2", 3),
        ]);
        assert_eq!(router.route("a.local", "/api").unwrap().service, "api");
        assert_eq!(router.route("a.local", "/api/users").unwrap().service, "api");
        assert_eq!(router.route("a.local", "/api/v2/users").unwrap().service, "api-v2");
        assert_eq!(router.route("a.local", "/apix").unwrap().service, "web");
    }

    #[test]
    fn first_registered_wins_tie() {
        let router = router(vec![
            rule("second", "a.local", "/api/", "late", 7),
            rule("first", "a.local", "/api", "early", 3),
        ]);
        assert_eq!(router.route("a.local", "/api/x").unwrap().rule, "first");
    }

    #[test]
    fn no_match_is_route_not_found() {
        let router = router(vec![rule("api", "a.local", "/api", "api", 1)]);
        assert_eq!(
            router.route("a.local", "/web"),
            Err(RouteError::NotFound {
                host: "a.local".to_string(),
                path: "/web".to_string()
            })
        );
    }

    #[test]
    fn upsert_and_remove() {
        let router = IngressRouter::new();
        router.upsert(rule("api", "a.local", "/api", "api", 2));
        router.upsert(rule("root", "a.local", "/", "web", 1));
        router.upsert(rule("api", "a.local", "/api", "api-v2", 2));

        let names: Vec<_> = router.rules().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["root", "api"]);
        assert_eq!(router.route("a.local", "/api").unwrap().service, "api-v2");

        assert!(router.remove("api"));
        assert!(!router.remove("api"));
        assert_eq!(router.route("a.local", "/api").unwrap().service, "web");
    }
}
