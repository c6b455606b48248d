//! Handler registration.
//!
//! A [`HandlerRegistry`] maps resource names to [`ResourceDescriptor`]s, each listing the
//! [`MethodDescriptor`]s it exposes. [`Router`] is the registry built by hand at startup:
//!
//! ```
//! use embedded_servers::http::{BoxError, Json, Router};
//! use hyper::Method;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(Default)]
//! struct Stats {
//!     hits: AtomicU64,
//! }
//!
//! let router = Router::new().resource("stats", Stats::default, |r| {
//!     r.method("hit", &[], |stats: &Stats, _| {
//!         Ok::<_, BoxError>(stats.hits.fetch_add(1, Ordering::Relaxed) + 1)
//!     })
//!     .route(Method::POST, "increment")
//!     .function("version", &[], |_| Ok::<_, BoxError>(Json(["1", "0"])))
//! });
//! # let _ = router;
//! ```
//!
//! One instance per resource is shared by every request, possibly concurrently. Handlers
//! receive `&T`, so any mutable state must use interior mutability that is safe across
//! threads (atomics, `Mutex`).

use std::{any::Any, fmt, marker::PhantomData, sync::Arc};

use hyper::Method;
use serde::Serialize;
use thiserror::Error;

/// Error type returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A lazily created resource instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

type Factory = Arc<dyn Fn() -> Instance + Send + Sync>;
type Handler =
    Arc<dyn Fn(Option<&(dyn Any + Send + Sync)>, &Params) -> Result<Reply, BoxError> + Send + Sync>;

/// A declared parameter was not supplied in the query string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("missing parameter `{0}`")]
pub struct MissingParameter(pub String);

/// Query values bound to a handler's declared parameters, in declaration order.
///
/// A declared parameter absent from the query is bound to `None`; deciding whether that is an
/// error is up to the handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: Vec<(String, Option<String>)>,
}

impl Params {
    /// Binds each declared name to the first query pair with the same name, ignoring case.
    pub fn bind<S: AsRef<str>>(declared: &[S], query: &[(String, String)]) -> Self {
        let values = declared
            .iter()
            .map(|name| {
                let name = name.as_ref();
                let value = query
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value.clone());
                (name.to_string(), value)
            })
            .collect();
        Self { values }
    }

    /// Value bound to `name`, if it was declared and supplied.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(declared, _)| declared == name)
            .and_then(|(_, value)| value.as_deref())
    }

    /// Like [`get`](Self::get), but missing values become an error handlers can `?`.
    pub fn require(&self, name: &str) -> Result<&str, MissingParameter> {
        self.get(name)
            .ok_or_else(|| MissingParameter(name.to_string()))
    }

    /// Declared parameters with their bound values, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Classification of a handler's return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    /// Nothing: the response body is empty.
    Void,
    /// Text returned verbatim.
    Text,
    /// A value serialized to JSON.
    Structured,
}

/// A handler result ready to be written as a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Empty,
    Text(String),
    /// Serialized JSON.
    Json(String),
}

impl Reply {
    pub fn kind(&self) -> ReturnKind {
        match self {
            Reply::Empty => ReturnKind::Void,
            Reply::Text(_) => ReturnKind::Text,
            Reply::Json(_) => ReturnKind::Structured,
        }
    }

    pub fn into_body(self) -> String {
        match self {
            Reply::Empty => String::new(),
            Reply::Text(text) | Reply::Json(text) => text,
        }
    }
}

/// Wraps a value to be returned as JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

/// Conversion of handler return values into a [`Reply`].
pub trait IntoReply {
    /// How the value is rendered.
    const KIND: ReturnKind;

    fn into_reply(self) -> Result<Reply, serde_json::Error>;
}

impl IntoReply for () {
    const KIND: ReturnKind = ReturnKind::Void;

    fn into_reply(self) -> Result<Reply, serde_json::Error> {
        Ok(Reply::Empty)
    }
}

impl IntoReply for String {
    const KIND: ReturnKind = ReturnKind::Text;

    fn into_reply(self) -> Result<Reply, serde_json::Error> {
        Ok(Reply::Text(self))
    }
}

impl IntoReply for &'static str {
    const KIND: ReturnKind = ReturnKind::Text;

    fn into_reply(self) -> Result<Reply, serde_json::Error> {
        Ok(Reply::Text(self.to_string()))
    }
}

impl<T: Serialize> IntoReply for Json<T> {
    const KIND: ReturnKind = ReturnKind::Structured;

    fn into_reply(self) -> Result<Reply, serde_json::Error> {
        serde_json::to_string(&self.0).map(Reply::Json)
    }
}

impl IntoReply for serde_json::Value {
    const KIND: ReturnKind = ReturnKind::Structured;

    fn into_reply(self) -> Result<Reply, serde_json::Error> {
        serde_json::to_string(&self).map(Reply::Json)
    }
}

macro_rules! structured_reply {
    ($($ty:ty),*) => {
        $(
            impl IntoReply for $ty {
                const KIND: ReturnKind = ReturnKind::Structured;

                fn into_reply(self) -> Result<Reply, serde_json::Error> {
                    serde_json::to_string(&self).map(Reply::Json)
                }
            }
        )*
    };
}

structured_reply!(bool, i32, i64, u32, u64, usize, f32, f64);

/// A callable exposed by a resource.
#[derive(Clone)]
pub struct MethodDescriptor {
    name: String,
    params: Vec<String>,
    routes: Vec<(Method, String)>,
    kind: ReturnKind,
    is_static: bool,
    handler: Handler,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter names, in order.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// `(verb, alias)` pairs this method also answers to.
    pub fn routes(&self) -> &[(Method, String)] {
        &self.routes
    }

    pub fn kind(&self) -> ReturnKind {
        self.kind
    }

    /// Static methods run without the resource instance.
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Calls the handler. `instance` is ignored by static methods.
    pub fn call(
        &self,
        instance: Option<&(dyn Any + Send + Sync)>,
        params: &Params,
    ) -> Result<Reply, BoxError> {
        (self.handler)(instance, params)
    }

    fn answers(&self, verb: &Method, action: &str) -> bool {
        self.routes
            .iter()
            .any(|(method, alias)| method == verb && alias.eq_ignore_ascii_case(action))
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("routes", &self.routes)
            .field("kind", &self.kind)
            .field("is_static", &self.is_static)
            .finish_non_exhaustive()
    }
}

/// A named group of methods sharing one lazily created instance.
#[derive(Clone)]
pub struct ResourceDescriptor {
    name: String,
    factory: Factory,
    methods: Vec<MethodDescriptor>,
}

impl ResourceDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Resolves `action` for a request made with `verb`.
    ///
    /// A method whose name equals `action` (ignoring case) wins regardless of the verb.
    /// Otherwise the first method with a `verb` route aliased to `action` is returned.
    pub fn find_method(&self, action: &str, verb: &Method) -> Option<&MethodDescriptor> {
        self.methods
            .iter()
            .find(|method| method.name.eq_ignore_ascii_case(action))
            .or_else(|| {
                self.methods
                    .iter()
                    .find(|method| method.answers(verb, action))
            })
    }

    /// Builds a new instance of the resource type.
    pub fn create_instance(&self) -> Instance {
        (self.factory)()
    }
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

/// Resolves resource names to descriptors.
pub trait HandlerRegistry: Send + Sync + 'static {
    fn lookup(&self, resource: &str) -> Option<&ResourceDescriptor>;
}

/// Declares the methods of a resource backed by `T`.
pub struct ResourceBuilder<T> {
    methods: Vec<MethodDescriptor>,
    _instance: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ResourceBuilder<T> {
    fn new() -> Self {
        Self {
            methods: Vec::new(),
            _instance: PhantomData,
        }
    }

    /// Registers a handler that runs against the shared instance.
    pub fn method<F, R, E>(self, name: &str, params: &[&str], handler: F) -> Self
    where
        F: Fn(&T, &Params) -> Result<R, E> + Send + Sync + 'static,
        R: IntoReply,
        E: Into<BoxError>,
    {
        let handler: Handler = Arc::new(
            move |instance: Option<&(dyn Any + Send + Sync)>,
                  params: &Params|
                  -> Result<Reply, BoxError> {
                let instance = instance
                    .and_then(|instance| instance.downcast_ref::<T>())
                    .ok_or("resource instance is unavailable")?;
                let reply = handler(instance, params).map_err(Into::<BoxError>::into)?;
                Ok(reply.into_reply()?)
            },
        );
        self.push(name, params, R::KIND, false, handler)
    }

    /// Registers a handler that does not need the instance.
    pub fn function<F, R, E>(self, name: &str, params: &[&str], handler: F) -> Self
    where
        F: Fn(&Params) -> Result<R, E> + Send + Sync + 'static,
        R: IntoReply,
        E: Into<BoxError>,
    {
        let handler: Handler = Arc::new(
            move |_: Option<&(dyn Any + Send + Sync)>,
                  params: &Params|
                  -> Result<Reply, BoxError> {
                let reply = handler(params).map_err(Into::<BoxError>::into)?;
                Ok(reply.into_reply()?)
            },
        );
        self.push(name, params, R::KIND, true, handler)
    }

    /// Makes the last registered method also answer `verb` requests for `alias`.
    pub fn route(mut self, verb: Method, alias: &str) -> Self {
        match self.methods.last_mut() {
            Some(method) => method.routes.push((verb, alias.to_string())),
            None => log::warn!("route {verb} {alias} declared before any method, ignored"),
        }
        self
    }

    fn push(
        mut self,
        name: &str,
        params: &[&str],
        kind: ReturnKind,
        is_static: bool,
        handler: Handler,
    ) -> Self {
        self.methods.push(MethodDescriptor {
            name: name.to_string(),
            params: params.iter().map(|param| param.to_string()).collect(),
            routes: Vec::new(),
            kind,
            is_static,
            handler,
        });
        self
    }
}

/// The explicit registration table.
#[derive(Debug, Clone, Default)]
pub struct Router {
    resources: Vec<ResourceDescriptor>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource named `name` whose instance is built by `factory` on first use.
    ///
    /// A resource registered under an existing name (ignoring case) replaces it.
    pub fn resource<T, F, B>(mut self, name: &str, factory: F, build: B) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
        B: FnOnce(ResourceBuilder<T>) -> ResourceBuilder<T>,
    {
        let methods = build(ResourceBuilder::new()).methods;
        let factory: Factory = Arc::new(move || Arc::new(factory()) as Instance);

        self.resources
            .retain(|resource| !resource.name.eq_ignore_ascii_case(name));
        self.resources.push(ResourceDescriptor {
            name: name.to_string(),
            factory,
            methods,
        });
        self
    }

    pub fn resources(&self) -> &[ResourceDescriptor] {
        &self.resources
    }
}

impl HandlerRegistry for Router {
    fn lookup(&self, resource: &str) -> Option<&ResourceDescriptor> {
        self.resources
            .iter()
            .find(|descriptor| descriptor.name.eq_ignore_ascii_case(resource))
    }
}
