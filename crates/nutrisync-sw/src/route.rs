//! Request classification.

use nutrisync_net::Request;
use tracing::trace;
use url::Url;

use crate::config::GatewayConfig;

/// How a request is routed. Recomputed for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Backend inference traffic: network first, cache fallback.
    Api,
    /// Shell assets and everything else same-origin: cache first.
    Static,
    /// Not ours: passed through untouched.
    CrossOrigin,
}

/// Path/port pattern that marks API traffic.
#[derive(Debug, Clone)]
pub enum ApiPattern {
    /// Path starts with the prefix.
    PathPrefix(String),
    /// URL targets the port explicitly.
    Port(u16),
}

impl ApiPattern {
    pub fn matches(&self, url: &Url) -> bool {
        match self {
            ApiPattern::PathPrefix(prefix) => url.path().starts_with(prefix.as_str()),
            ApiPattern::Port(port) => url.port() == Some(*port),
        }
    }
}

/// Classifies requests against an origin and a set of API patterns.
#[derive(Debug, Clone)]
pub struct Router {
    origin: url::Origin,
    api_patterns: Vec<ApiPattern>,
}

impl Router {
    pub fn new(origin: &Url) -> Self {
        Self {
            origin: origin.origin(),
            api_patterns: Vec::new(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut router = Self::new(&config.origin).api(ApiPattern::PathPrefix(config.api_prefix.clone()));
        if let Some(port) = config.api_port {
            router = router.api(ApiPattern::Port(port));
        }
        router
    }

    /// Add an API pattern.
    pub fn api(mut self, pattern: ApiPattern) -> Self {
        self.api_patterns.push(pattern);
        self
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin
    }

    /// Classify a request. API patterns win over the request mode, so an
    /// API-prefixed navigation is still API traffic.
    pub fn classify(&self, request: &Request) -> RequestClass {
        let class = if !self.is_same_origin(&request.url) {
            RequestClass::CrossOrigin
        } else if self.api_patterns.iter().any(|p| p.matches(&request.url)) {
            RequestClass::Api
        } else {
            RequestClass::Static
        };
        trace!(url = %request.url, ?class, "Classified request");
        class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::from_config(&GatewayConfig::for_origin(
            Url::parse("https://nutrisync.app/").unwrap(),
        ))
    }

    fn classify(router: &Router, url: &str) -> RequestClass {
        router.classify(&Request::parse(url).unwrap())
    }

    #[test]
    fn test_api_prefix() {
        let r = router();
        assert_eq!(classify(&r, "https://nutrisync.app/api/predict_compatibility"), RequestClass::Api);
        assert_eq!(classify(&r, "https://nutrisync.app/api/scan_prescription?x=1"), RequestClass::Api);
        // Prefix is "/api/", so a bare "/api" or "/apiary" is not API traffic.
        assert_eq!(classify(&r, "https://nutrisync.app/apiary"), RequestClass::Static);
    }

    #[test]
    fn test_static_assets() {
        let r = router();
        assert_eq!(classify(&r, "https://nutrisync.app/"), RequestClass::Static);
        assert_eq!(classify(&r, "https://nutrisync.app/icon-192.png"), RequestClass::Static);
    }

    #[test]
    fn test_cross_origin() {
        let r = router();
        assert_eq!(classify(&r, "https://fonts.example.com/api/x"), RequestClass::CrossOrigin);
        assert_eq!(classify(&r, "http://nutrisync.app/"), RequestClass::CrossOrigin);
        assert_eq!(classify(&r, "https://nutrisync.app:8001/predict"), RequestClass::CrossOrigin);
    }

    #[test]
    fn test_api_port_on_same_origin() {
        let config = GatewayConfig::for_origin(Url::parse("http://localhost:8001/").unwrap());
        let r = Router::from_config(&config);
        assert_eq!(classify(&r, "http://localhost:8001/predict"), RequestClass::Api);
    }

    #[test]
    fn test_api_wins_over_navigation() {
        let r = router();
        let request = Request::navigate(Url::parse("https://nutrisync.app/api/suggest").unwrap());
        assert_eq!(r.classify(&request), RequestClass::Api);
    }

    #[test]
    fn test_no_port_pattern() {
        let mut config = GatewayConfig::for_origin(Url::parse("http://localhost:8001/").unwrap());
        config.api_port = None;
        let r = Router::from_config(&config);
        assert_eq!(classify(&r, "http://localhost:8001/predict"), RequestClass::Static);
    }
}
