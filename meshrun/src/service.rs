//! Local service definitions.
//!
//! A [`ServiceSchema`] bundles the actions and event subscriptions a node
//! hosts. Registering it with the registry turns every action into a local
//! endpoint and bumps the local node's info seq so peers learn about it.
//!
//! # Example
//!
//! ```rust,ignore
//! let math = ServiceSchema::new("math").action("add", |ctx: Context| async move {
//!     let a = ctx.param("a").and_then(Value::as_i64).unwrap_or(0);
//!     let b = ctx.param("b").and_then(Value::as_i64).unwrap_or(0);
//!     Ok(Reply::from(json!(a + b)))
//! });
//! broker.register_service(math)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::error::MeshError;
use crate::packet::{ActionDescriptor, EventDescriptor, Meta, ServiceDescriptor};
use crate::strategy::StrategyKind;
use crate::transit::stream::ChunkSource;

/// Successful result of an action.
#[derive(Debug, Default)]
pub struct Reply {
    /// Result data.
    pub data: Value,
    /// Metadata merged into the caller's context.
    pub meta: Meta,
    /// Outbound response stream.
    pub stream: Option<ChunkSource>,
}

impl Reply {
    /// Reply carrying a byte stream.
    pub fn stream(stream: ChunkSource) -> Self {
        Self {
            data: Value::Null,
            meta: Meta::new(),
            stream: Some(stream),
        }
    }

    /// Add one metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }
}

impl From<Value> for Reply {
    fn from(data: Value) -> Self {
        Self {
            data,
            meta: Meta::new(),
            stream: None,
        }
    }
}

/// Handler of a local action.
#[async_trait(?Send)]
pub trait ActionHandler {
    /// Execute the action.
    async fn handle(&self, ctx: Context) -> Result<Reply, MeshError>;
}

#[async_trait(?Send)]
impl<F, Fut> ActionHandler for F
where
    F: Fn(Context) -> Fut + 'static,
    Fut: Future<Output = Result<Reply, MeshError>> + 'static,
{
    async fn handle(&self, ctx: Context) -> Result<Reply, MeshError> {
        (self)(ctx).await
    }
}

/// Handler of a local event subscription.
#[async_trait(?Send)]
pub trait EventHandler {
    /// Process the event.
    async fn handle(&self, ctx: Context) -> Result<(), MeshError>;
}

#[async_trait(?Send)]
impl<F, Fut> EventHandler for F
where
    F: Fn(Context) -> Fut + 'static,
    Fut: Future<Output = Result<(), MeshError>> + 'static,
{
    async fn handle(&self, ctx: Context) -> Result<(), MeshError> {
        (self)(ctx).await
    }
}

/// Action as stored in the action catalog.
///
/// Remote actions have no handler.
#[derive(Clone)]
pub struct ActionDefinition {
    /// Wire descriptor.
    pub descriptor: ActionDescriptor,
    /// Full name of the owning service.
    pub service: String,
    /// Local handler.
    pub handler: Option<Rc<dyn ActionHandler>>,
}

impl fmt::Debug for ActionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDefinition")
            .field("name", &self.descriptor.name)
            .field("service", &self.service)
            .field("local", &self.handler.is_some())
            .finish()
    }
}

/// Event subscription as stored in the event catalog.
#[derive(Clone)]
pub struct EventDefinition {
    /// Wire descriptor.
    pub descriptor: EventDescriptor,
    /// Full name of the owning service.
    pub service: String,
    /// Resolved consumer group.
    pub group: String,
    /// Local handler.
    pub handler: Option<Rc<dyn EventHandler>>,
}

impl fmt::Debug for EventDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDefinition")
            .field("name", &self.descriptor.name)
            .field("group", &self.group)
            .field("service", &self.service)
            .field("local", &self.handler.is_some())
            .finish()
    }
}

/// Declarative description of a local service.
pub struct ServiceSchema {
    name: String,
    version: Option<String>,
    settings: Meta,
    metadata: Meta,
    actions: Vec<(ActionDescriptor, Rc<dyn ActionHandler>)>,
    events: Vec<(EventDescriptor, Rc<dyn EventHandler>)>,
}

impl ServiceSchema {
    /// Start a schema for service `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            settings: Meta::new(),
            metadata: Meta::new(),
            actions: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Set the service version; it prefixes the full name (`v2.math`).
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Add a setting.
    pub fn setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Add a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Add an action named `service.name`.
    pub fn action<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + 'static,
        Fut: Future<Output = Result<Reply, MeshError>> + 'static,
    {
        self.action_with(ActionDescriptor::new(name), handler)
    }

    /// Add an action with a full descriptor; `descriptor.name` is the short
    /// name and is qualified with the service full name.
    pub fn action_with<F, Fut>(self, descriptor: ActionDescriptor, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + 'static,
        Fut: Future<Output = Result<Reply, MeshError>> + 'static,
    {
        self.action_handler(descriptor, Rc::new(handler))
    }

    /// Add an action using a strategy of its own.
    pub fn action_with_strategy<F, Fut>(
        self,
        name: impl Into<String>,
        strategy: StrategyKind,
        handler: F,
    ) -> Self
    where
        F: Fn(Context) -> Fut + 'static,
        Fut: Future<Output = Result<Reply, MeshError>> + 'static,
    {
        let mut descriptor = ActionDescriptor::new(name);
        descriptor.strategy = Some(strategy);
        self.action_with(descriptor, handler)
    }

    /// Add an action backed by any [`ActionHandler`].
    pub fn action_handler(mut self, descriptor: ActionDescriptor, handler: Rc<dyn ActionHandler>) -> Self {
        self.actions.push((descriptor, handler));
        self
    }

    /// Subscribe to `event` in the default group (the service name).
    pub fn event<F, Fut>(self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + 'static,
        Fut: Future<Output = Result<(), MeshError>> + 'static,
    {
        let descriptor = EventDescriptor {
            name: event.into(),
            group: None,
        };
        self.event_handler(descriptor, Rc::new(handler))
    }

    /// Subscribe to `event` in an explicit group.
    pub fn event_in_group<F, Fut>(
        self,
        event: impl Into<String>,
        group: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(Context) -> Fut + 'static,
        Fut: Future<Output = Result<(), MeshError>> + 'static,
    {
        let descriptor = EventDescriptor {
            name: event.into(),
            group: Some(group.into()),
        };
        self.event_handler(descriptor, Rc::new(handler))
    }

    /// Subscribe with any [`EventHandler`].
    pub fn event_handler(mut self, descriptor: EventDescriptor, handler: Rc<dyn EventHandler>) -> Self {
        self.events.push((descriptor, handler));
        self
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name with version prefix.
    pub fn full_name(&self) -> String {
        full_service_name(&self.name, self.version.as_deref())
    }

    /// Split into the wire descriptor and the local definitions.
    pub(crate) fn into_parts(self) -> (ServiceDescriptor, Vec<ActionDefinition>, Vec<EventDefinition>) {
        let full_name = self.full_name();
        let mut actions = Vec::with_capacity(self.actions.len());
        let mut action_descriptors = HashMap::new();
        for (mut descriptor, handler) in self.actions {
            descriptor.name = format!("{}.{}", full_name, descriptor.name);
            action_descriptors.insert(descriptor.name.clone(), descriptor.clone());
            actions.push(ActionDefinition {
                descriptor,
                service: full_name.clone(),
                handler: Some(handler),
            });
        }

        let mut events = Vec::with_capacity(self.events.len());
        let mut event_descriptors = HashMap::new();
        for (descriptor, handler) in self.events {
            let group = descriptor
                .group
                .clone()
                .unwrap_or_else(|| self.name.clone());
            event_descriptors.insert(descriptor.name.clone(), descriptor.clone());
            events.push(EventDefinition {
                descriptor,
                service: full_name.clone(),
                group,
                handler: Some(handler),
            });
        }

        let descriptor = ServiceDescriptor {
            name: self.name,
            version: self.version,
            full_name,
            settings: self.settings,
            metadata: self.metadata,
            actions: action_descriptors,
            events: event_descriptors,
        };
        (descriptor, actions, events)
    }
}

impl fmt::Debug for ServiceSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSchema")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("actions", &self.actions.len())
            .field("events", &self.events.len())
            .finish()
    }
}

/// `version.name`, or just `name` without a version.
pub fn full_service_name(name: &str, version: Option<&str>) -> String {
    match version {
        Some(v) if !v.is_empty() => format!("{}.{}", v, name),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_parts_qualifies_names() {
        let schema = ServiceSchema::new("math")
            .version("v2")
            .action("add", |_ctx: Context| async { Ok(Reply::from(json!(1))) })
            .event("user.*", |_ctx: Context| async { Ok(()) })
            .event_in_group("order.created", "billing", |_ctx: Context| async { Ok(()) });

        let (descriptor, actions, events) = schema.into_parts();
        assert_eq!(descriptor.full_name, "v2.math");
        assert!(descriptor.actions.contains_key("v2.math.add"));
        assert_eq!(actions[0].descriptor.name, "v2.math.add");
        assert_eq!(actions[0].service, "v2.math");

        let groups: Vec<_> = events.iter().map(|e| e.group.as_str()).collect();
        assert_eq!(groups, vec!["math", "billing"]);
    }

    #[test]
    fn test_full_service_name() {
        assert_eq!(full_service_name("users", None), "users");
        assert_eq!(full_service_name("users", Some("v1")), "v1.users");
    }
}
