//! Static service-name → upstream lookup.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Connection info for one upstream domain service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEndpoint {
    /// Logical name selected by `/api/v1/<name>/...`
    pub name: String,
    /// Upstream origin without a trailing slash
    pub base_url: String,
    /// Per-request timeout for forwarded calls
    #[serde(rename = "timeout_ms", serialize_with = "duration_millis")]
    pub timeout: Duration,
    /// Extra attempts allowed for idempotent requests on transport errors.
    pub retry_budget: u32,
}

fn duration_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ServiceEndpoint {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        retry_budget: u32,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            retry_budget,
        }
    }

    /// Absolute URL for a path on this upstream.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

/// Outcome of a lookup.
#[derive(Debug, Clone)]
pub enum Resolution {
    Found(Arc<ServiceEndpoint>),
    NotRegistered,
}

/// Immutable lookup table built once at startup.
#[derive(Debug, Clone, Default)]
pub struct EndpointResolver {
    endpoints: HashMap<String, Arc<ServiceEndpoint>>,
}

impl EndpointResolver {
    /// Build the table. Later duplicates of a name replace earlier ones.
    pub fn new(endpoints: impl IntoIterator<Item = ServiceEndpoint>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|e| (e.name.clone(), Arc::new(e)))
            .collect();
        Self { endpoints }
    }

    pub fn resolve(&self, name: &str) -> Resolution {
        match self.endpoints.get(name) {
            Some(endpoint) => Resolution::Found(endpoint.clone()),
            None => Resolution::NotRegistered,
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.keys().cloned().collect();
        names.sort();
        names
    }

    /// All endpoints, sorted by name.
    pub fn endpoints(&self) -> Vec<Arc<ServiceEndpoint>> {
        let mut endpoints: Vec<Arc<ServiceEndpoint>> = self.endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> EndpointResolver {
        EndpointResolver::new(vec![
            ServiceEndpoint::new("auth", "http://auth:8001/", Duration::from_secs(5), 0),
            ServiceEndpoint::new("chat", "http://chat:8002", Duration::from_secs(5), 2),
        ])
    }

    #[test]
    fn test_resolve_known() {
        match resolver().resolve("chat") {
            Resolution::Found(endpoint) => {
                assert_eq!(endpoint.base_url, "http://chat:8002");
                assert_eq!(endpoint.retry_budget, 2);
            }
            Resolution::NotRegistered => panic!("chat should resolve"),
        }
    }

    #[test]
    fn test_resolve_unknown() {
        assert!(matches!(
            resolver().resolve("billing"),
            Resolution::NotRegistered
        ));
    }

    #[test]
    fn test_url_for_trims_trailing_slash() {
        let resolver = resolver();
        let Resolution::Found(auth) = resolver.resolve("auth") else {
            panic!("auth should resolve");
        };
        assert_eq!(auth.url_for("/health"), "http://auth:8001/health");
        assert_eq!(auth.url_for("login"), "http://auth:8001/login");
    }

    #[test]
    fn test_names_sorted() {
        assert_eq!(resolver().names(), vec!["auth", "chat"]);
    }
}
