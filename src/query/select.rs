//! Source selection.
//!
//! Order of precedence: an explicit hint from the request, a recognised
//! client keyword in the question text, then the full enabled set.

use std::collections::BTreeMap;

use crate::{config::ClientRoutingConfig, error::GatewayError, sources::SourceId};

struct ClientRoute {
    name: String,
    /// Lowercased keywords, matched as substrings of the lowercased text.
    keywords: Vec<String>,
    sources: Vec<SourceId>,
}

pub struct SourceSelector {
    enabled: Vec<SourceId>,
    clients: Vec<ClientRoute>,
}

impl SourceSelector {
    pub fn new(enabled: Vec<SourceId>, clients: &BTreeMap<String, ClientRoutingConfig>) -> Self {
        let clients = clients
            .iter()
            .map(|(name, routing)| ClientRoute {
                name: name.clone(),
                keywords: routing
                    .keywords
                    .iter()
                    .map(|keyword| keyword.to_lowercase())
                    .collect(),
                sources: routing.sources.clone(),
            })
            .collect();
        Self { enabled, clients }
    }

    /// Pick the sources to search for one question.
    ///
    /// A hint naming a source outside the closed set is a caller error.
    pub fn select(
        &self,
        text: &str,
        hint: Option<&[SourceId]>,
    ) -> Result<Vec<SourceId>, GatewayError> {
        if let Some(hint) = hint
            && !hint.is_empty()
        {
            let mut selected = Vec::new();
            for source in hint {
                if !self.enabled.contains(source) {
                    return Err(GatewayError::BadRequest(format!(
                        "unknown source '{source}'"
                    )));
                }
                if !selected.contains(source) {
                    selected.push(source.clone());
                }
            }
            return Ok(selected);
        }

        let lowered = text.to_lowercase();
        for client in &self.clients {
            if client
                .keywords
                .iter()
                .any(|keyword| lowered.contains(keyword))
            {
                tracing::debug!(client = %client.name, "client keyword matched");
                return Ok(client.sources.clone());
            }
        }

        Ok(self.enabled.clone())
    }
}
