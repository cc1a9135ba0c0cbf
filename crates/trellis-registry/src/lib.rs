//! Static capability registry and lifecycle-hook dispatch.
//!
//! Maps capability ids to handlers of a closed set of kinds: channel
//! adapters, tools, RPC methods, and hooks. The registry is populated once at
//! boot from a collaborator-supplied manifest and is read-only afterward,
//! except for a controlled whole-table swap used by hot reload. Readers never
//! take a lock.

mod capability_registry;
mod hook_dispatcher;
mod rpc_method;
mod tool_handler;

pub use capability_registry::{CapabilityManifest, CapabilityRegistry};
pub use hook_dispatcher::{
    HookDecision, HookHandler, HookRegistration, HOOK_AFTER_TOOL, HOOK_BEFORE_TOOL,
    HOOK_MESSAGE_RECEIVED, HOOK_RUN_END,
};
pub use rpc_method::{MethodError, RpcCallContext, RpcMethodHandler, RpcMethodRegistration};
pub use tool_handler::{ToolExecutionResult, ToolHandler};
