//! Shared read-only store of loaded flows.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::error::{DispatchError, EngineResult};
use crate::flow::Flow;

#[derive(Default)]
pub struct FlowRegistry {
    flows: DashMap<String, Arc<Flow>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, flow: Flow) -> Arc<Flow> {
        let flow = Arc::new(flow);
        if self.flows.insert(flow.id.clone(), flow.clone()).is_some() {
            warn!(flow_id = %flow.id, "replacing previously registered flow");
        }
        flow
    }

    pub fn get(&self, flow_id: &str) -> EngineResult<Arc<Flow>> {
        self.flows
            .get(flow_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                DispatchError::UnknownFlow {
                    flow_id: flow_id.to_string(),
                }
                .into()
            })
    }

    /// Load every document of a YAML source and register it. Returns the
    /// registered flow ids in document order.
    pub fn load_str(&self, source: &str) -> EngineResult<Vec<String>> {
        let flows = Flow::load_documents(source)?;
        let mut ids = Vec::with_capacity(flows.len());
        for flow in flows {
            ids.push(flow.id.clone());
            self.register(flow);
        }
        Ok(ids)
    }

    pub fn ids(&self) -> Vec<String> {
        self.flows.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
