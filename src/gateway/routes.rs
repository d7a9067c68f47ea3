//! # Route Table
//!
//! Maps request paths to services. Lookup order:
//!
//! 1. Configured prefixes, matched through a `matchit` radix tree. Each prefix
//!    is inserted twice: the exact path and `prefix/*rest`.
//! 2. The generic form `/api/<service>/...`, forwarded to `<service>`.
//! 3. The default service, if one is configured, receiving the path unchanged.

use matchit::Router as RadixRouter;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::RouteDefinition;
use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::StrategyKind;

/// Path prefix of the generic `/api/<service>/...` form
pub const GENERIC_API_PREFIX: &str = "/api/";

/// One configured route
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub prefix: String,
    pub service: String,
    pub strategy: Option<StrategyKind>,
    pub strip_prefix: bool,
    pub timeout: Option<Duration>,
    pub limit_class: Option<String>,
}

impl From<&RouteDefinition> for Route {
    fn from(definition: &RouteDefinition) -> Self {
        Self {
            prefix: definition.prefix.trim_end_matches('/').to_string(),
            service: definition.service.clone(),
            strategy: definition.strategy.as_deref().map(StrategyKind::from_name),
            strip_prefix: definition.strip_prefix,
            timeout: definition.timeout,
            limit_class: definition.limit_class.clone(),
        }
    }
}

/// Result of a route lookup
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub service: String,
    /// Path to request on the instance
    pub forward_path: String,
    pub strategy: Option<StrategyKind>,
    pub timeout: Option<Duration>,
    pub limit_class: Option<String>,
}

impl RouteMatch {
    fn plain(service: String, forward_path: String) -> Self {
        Self {
            service,
            forward_path,
            strategy: None,
            timeout: None,
            limit_class: None,
        }
    }
}

pub struct RouteTable {
    router: RadixRouter<Arc<Route>>,
    routes: Vec<Arc<Route>>,
    default_service: Option<String>,
}

impl RouteTable {
    pub fn new(default_service: Option<String>) -> Self {
        Self {
            router: RadixRouter::new(),
            routes: Vec::new(),
            default_service,
        }
    }

    pub fn from_config(definitions: &[RouteDefinition], default_service: Option<String>) -> GatewayResult<Self> {
        let mut table = Self::new(default_service);
        for definition in definitions {
            table.add_route(Route::from(definition))?;
        }
        Ok(table)
    }

    pub fn add_route(&mut self, route: Route) -> GatewayResult<()> {
        let route = Arc::new(route);
        for pattern in [route.prefix.clone(), format!("{}/*rest", route.prefix)] {
            self.router
                .insert(pattern.as_str(), route.clone())
                .map_err(|e| GatewayError::config(format!("Failed to add route '{}': {}", route.prefix, e)))?;
        }
        self.routes.push(route);
        Ok(())
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    fn configured(&self, path: &str) -> Option<Arc<Route>> {
        if let Ok(matched) = self.router.at(path) {
            return Some(matched.value.clone());
        }
        // "/api/users/" leaves an empty catch-all, which the tree does not match
        let trimmed = path.trim_end_matches('/');
        if trimmed.len() != path.len() && !trimmed.is_empty() {
            return self.router.at(trimmed).ok().map(|m| m.value.clone());
        }
        None
    }

    /// Resolve a request path to a service and the path to forward
    pub fn lookup(&self, path: &str) -> Option<RouteMatch> {
        if let Some(route) = self.configured(path) {
            let forward_path = if route.strip_prefix {
                let rest = path.get(route.prefix.len()..).unwrap_or("");
                if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                }
            } else {
                path.to_string()
            };

            return Some(RouteMatch {
                service: route.service.clone(),
                forward_path,
                strategy: route.strategy,
                timeout: route.timeout,
                limit_class: route.limit_class.clone(),
            });
        }

        if let Some(rest) = path.strip_prefix(GENERIC_API_PREFIX) {
            let (service, remainder) = match rest.find('/') {
                Some(index) => (&rest[..index], &rest[index..]),
                None => (rest, "/"),
            };
            if !service.is_empty() {
                return Some(RouteMatch::plain(service.to_string(), remainder.to_string()));
            }
        }

        self.default_service
            .as_ref()
            .map(|service| RouteMatch::plain(service.clone(), path.to_string()))
    }

    /// Limit class configured for the route serving `path`
    pub fn limit_class_for(&self, path: &str) -> Option<String> {
        self.configured(path).and_then(|route| route.limit_class.clone())
    }
}
