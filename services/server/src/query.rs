//! Diagnostic queries
//!
//! QUERY frames are legal in every stage and are answered in place with a
//! RESPONSE frame carrying the same correlation id. Answers come from a
//! [`QueryResponders`] table built once per server and shared by reference
//! with every connection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use types::{Query, Response};

pub const VERSION_QUERY: &str = "streamgate::version";
pub const HEALTH_QUERY: &str = "streamgate::health";
pub const CAPABILITIES_QUERY: &str = "streamgate::capabilities";
pub const CODECS_QUERY: &str = "streamgate::codecs";

type Responder = Arc<dyn Fn() -> String + Send + Sync>;

/// Query string → answer table
#[derive(Clone, Default)]
pub struct QueryResponders {
    responders: BTreeMap<String, Responder>,
}

impl QueryResponders {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in answers for version, health, strategies and codecs
    pub fn with_defaults(strategies: Vec<String>, codecs: Vec<String>) -> Self {
        let mut responders = Self::empty();
        responders.register(VERSION_QUERY, || env!("CARGO_PKG_VERSION").to_string());
        responders.register(HEALTH_QUERY, || "ok".to_string());

        let capabilities = strategies.join(",");
        responders.register(CAPABILITIES_QUERY, move || capabilities.clone());

        let codecs = codecs.join(",");
        responders.register(CODECS_QUERY, move || codecs.clone());
        responders
    }

    pub fn register<F>(&mut self, query: &str, responder: F)
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.responders.insert(query.to_string(), Arc::new(responder));
    }

    /// Answer a query; unknown queries get an empty response
    pub fn answer(&self, query: &Query) -> Response {
        let response = match self.responders.get(query.query.trim()) {
            Some(responder) => {
                debug!(query = %query.query, id = query.correlation_id, "Answering query");
                responder()
            }
            None => {
                warn!(query = %query.query, id = query.correlation_id, "Unknown query");
                String::new()
            }
        };

        Response {
            correlation_id: query.correlation_id,
            response,
        }
    }

    pub fn queries(&self) -> impl Iterator<Item = &str> {
        self.responders.keys().map(String::as_str)
    }
}

impl fmt::Debug for QueryResponders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.queries()).finish()
    }
}
