//! Request dispatch.
//!
//! [`Dispatcher::dispatch`] turns one [`PendingRequest`] into a [`Response`]. It never fails:
//! an unknown resource or action becomes `404 Page not found.` and a handler error or panic
//! becomes `500` with the error message as body.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, OnceLock},
};

use dashmap::DashMap;
use hyper::{Method, StatusCode};

use super::registry::{
    BoxError, HandlerRegistry, Instance, MethodDescriptor, Params, ResourceDescriptor, ReturnKind,
};

/// Body of every 404 response.
pub const NOT_FOUND: &str = "Page not found.";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

/// One inbound request, reduced to what dispatch needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub method: Method,
    pub resource: String,
    pub action: String,
    /// Decoded query pairs, in order.
    pub query: Vec<(String, String)>,
}

impl PendingRequest {
    /// Builds a request from a path such as `/echo/add` and a raw query string.
    pub fn new(method: Method, path: &str, query: Option<&str>) -> Self {
        let (resource, action) = resolve_path(path);
        let query = query
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        Self {
            method,
            resource,
            action,
            query,
        }
    }
}

/// Splits a path into `(resource, action)`: its first and second segments.
///
/// Leading, trailing and repeated slashes are ignored. Missing segments are empty strings.
pub fn resolve_path(path: &str) -> (String, String) {
    let mut segments = path.split('/').filter(|segment| !segment.is_empty());
    let resource = segments.next().unwrap_or_default().to_string();
    let action = segments.next().unwrap_or_default().to_string();
    (resource, action)
}

/// Outcome of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl Response {
    pub fn ok(kind: ReturnKind, body: String) -> Self {
        let content_type = match kind {
            ReturnKind::Structured => APPLICATION_JSON,
            ReturnKind::Void | ReturnKind::Text => TEXT_PLAIN,
        };
        Self {
            status: StatusCode::OK,
            content_type,
            body,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            content_type: TEXT_PLAIN,
            body: NOT_FOUND.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            content_type: TEXT_PLAIN,
            body: message.into(),
        }
    }
}

/// Resolves and invokes handlers from a [`HandlerRegistry`].
///
/// Resource instances are created on first use and then shared by every later call, including
/// concurrent ones. Creation happens exactly once per resource even when first requests race.
pub struct Dispatcher {
    registry: Box<dyn HandlerRegistry>,
    instances: DashMap<String, Arc<OnceLock<Instance>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(registry: impl HandlerRegistry) -> Self {
        Self {
            registry: Box::new(registry),
            instances: DashMap::new(),
        }
    }

    /// Finds the handler for `action` on `resource`.
    pub fn resolve_handler(
        &self,
        resource: &str,
        method: &Method,
        action: &str,
    ) -> Option<(&ResourceDescriptor, &MethodDescriptor)> {
        let descriptor = self.registry.lookup(resource)?;
        let handler = descriptor.find_method(action, method)?;
        Some((descriptor, handler))
    }

    /// Binds `query` to the handler's parameters, calls it and renders the result.
    ///
    /// Instance methods get the resource's shared instance, created here on first use.
    pub fn invoke(
        &self,
        resource: &ResourceDescriptor,
        handler: &MethodDescriptor,
        query: &[(String, String)],
    ) -> Result<String, BoxError> {
        let params = Params::bind(handler.params(), query);
        let instance = (!handler.is_static()).then(|| self.instance(resource));
        let reply = handler.call(instance.as_deref(), &params)?;
        Ok(reply.into_body())
    }

    /// Resolves and invokes the handler for `request`.
    pub fn dispatch(&self, request: &PendingRequest) -> Response {
        let response = self.respond(request);
        log::debug!(
            "{} /{}/{} -> {}",
            request.method,
            request.resource,
            request.action,
            response.status
        );
        response
    }

    /// Number of resource instances created so far.
    pub fn instance_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .count()
    }

    fn respond(&self, request: &PendingRequest) -> Response {
        let Some((resource, handler)) =
            self.resolve_handler(&request.resource, &request.method, &request.action)
        else {
            return Response::not_found();
        };

        let kind = handler.kind();
        match catch_unwind(AssertUnwindSafe(|| {
            self.invoke(resource, handler, &request.query)
        })) {
            Ok(Ok(body)) => Response::ok(kind, body),
            Ok(Err(err)) => {
                log::debug!("{}.{} failed: {err}", resource.name(), handler.name());
                Response::error(err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                log::error!("{}.{} panicked: {message}", resource.name(), handler.name());
                Response::error(message)
            }
        }
    }

    fn instance(&self, resource: &ResourceDescriptor) -> Instance {
        let cell = Arc::clone(
            self.instances
                .entry(resource.name().to_ascii_lowercase())
                .or_default()
                .value(),
        );
        Arc::clone(cell.get_or_init(|| {
            log::debug!("creating instance for resource {}", resource.name());
            resource.create_instance()
        }))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
