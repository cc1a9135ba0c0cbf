//! Capability manifest and the boot-time registry built from it.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use trellis_ai::ToolDefinition;
use trellis_channel::ChannelAdapter;

use crate::hook_dispatcher::{dispatch_hook, HookDecision, HookRegistration};
use crate::rpc_method::RpcMethodRegistration;
use crate::tool_handler::ToolHandler;

#[derive(Default)]
/// Collaborator-supplied set of handlers, assembled before the core starts.
pub struct CapabilityManifest {
    channels: Vec<Arc<dyn ChannelAdapter>>,
    tools: Vec<(ToolDefinition, Arc<dyn ToolHandler>)>,
    methods: Vec<RpcMethodRegistration>,
    hooks: Vec<HookRegistration>,
}

impl CapabilityManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_channel(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.channels.push(adapter);
        self
    }

    pub fn register_tool(
        mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        self.tools.push((definition, handler));
        self
    }

    pub fn register_method(mut self, registration: RpcMethodRegistration) -> Self {
        self.methods.push(registration);
        self
    }

    pub fn register_hook(mut self, registration: HookRegistration) -> Self {
        self.hooks.push(registration);
        self
    }
}

struct RegistryTables {
    channels: BTreeMap<String, Arc<dyn ChannelAdapter>>,
    tools: BTreeMap<String, (ToolDefinition, Arc<dyn ToolHandler>)>,
    methods: BTreeMap<String, RpcMethodRegistration>,
    hooks: BTreeMap<String, Vec<HookRegistration>>,
}

impl RegistryTables {
    fn from_manifest(manifest: CapabilityManifest) -> Self {
        let mut channels = BTreeMap::new();
        for adapter in manifest.channels {
            channels.insert(adapter.channel_id().to_string(), adapter);
        }
        let mut tools = BTreeMap::new();
        for (definition, handler) in manifest.tools {
            tools.insert(definition.name.clone(), (definition, handler));
        }
        let mut methods = BTreeMap::new();
        for registration in manifest.methods {
            methods.insert(registration.name.clone(), registration);
        }
        let mut hooks: BTreeMap<String, Vec<HookRegistration>> = BTreeMap::new();
        for registration in manifest.hooks {
            hooks
                .entry(registration.hook.clone())
                .or_default()
                .push(registration);
        }
        for registrations in hooks.values_mut() {
            registrations.sort_by_key(|registration| registration.priority);
        }
        Self {
            channels,
            tools,
            methods,
            hooks,
        }
    }
}

/// Read-mostly lookup from capability id to handler. Lock-free readers; the
/// only mutation is a whole-table swap during hot reload.
pub struct CapabilityRegistry {
    tables: ArcSwap<RegistryTables>,
}

impl CapabilityRegistry {
    pub fn from_manifest(manifest: CapabilityManifest) -> Self {
        Self {
            tables: ArcSwap::from_pointee(RegistryTables::from_manifest(manifest)),
        }
    }

    /// Hot reload: atomically replaces every table. In-flight lookups keep
    /// the table they already loaded.
    pub fn swap(&self, manifest: CapabilityManifest) {
        self.tables
            .store(Arc::new(RegistryTables::from_manifest(manifest)));
    }

    pub fn channel(&self, channel_id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.tables.load().channels.get(channel_id).cloned()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.tables.load().channels.keys().cloned().collect()
    }

    pub fn tool(&self, name: &str) -> Option<(ToolDefinition, Arc<dyn ToolHandler>)> {
        self.tables.load().tools.get(name).cloned()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tables
            .load()
            .tools
            .values()
            .map(|(definition, _)| definition.clone())
            .collect()
    }

    pub fn method(&self, name: &str) -> Option<RpcMethodRegistration> {
        self.tables.load().methods.get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<String> {
        self.tables.load().methods.keys().cloned().collect()
    }

    /// Dispatches one hook point through its ordered subscriber list.
    pub async fn dispatch_hook(&self, hook: &str, payload: &Value) -> HookDecision {
        let tables = self.tables.load_full();
        let Some(registrations) = tables.hooks.get(hook) else {
            return HookDecision::Continue;
        };
        dispatch_hook(registrations, hook, payload).await
    }
}
