//! Ordered interceptor chains applied around every call.
//!
//! An interceptor receives the call context and a [`Next`] handle for the rest
//! of the chain. It either forwards with [`Next::run`] or short-circuits by
//! returning an error. The chain runs in configured order: the first
//! interceptor is outermost, so for `[A, B]` a call enters A, then B, and
//! leaves B before A.
//!
//! The same chain type is installed on both sides. On a channel it wraps the
//! outgoing request; on a service host it wraps dispatch to the registered
//! handler.
//!
//! ```ignore
//! use horizon_lattice_rpc::interceptor::{CallContext, InterceptFuture, Interceptor, Next};
//!
//! struct RequireToken;
//!
//! impl Interceptor for RequireToken {
//!     fn intercept<'a>(&'a self, ctx: CallContext, next: Next<'a>) -> InterceptFuture<'a> {
//!         if ctx.metadata().get("authorization").is_none() {
//!             return Box::pin(async {
//!                 Err(GrpcError::rejected(Code::Unauthenticated, "missing token"))
//!             });
//!         }
//!         next.run(ctx)
//!     }
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tonic::body::Body;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::{Code, Status};
use tower::{Layer, Service};

use crate::error::{GrpcError, Result};

const TARGET: &str = "horizon_lattice_rpc::interceptor";

/// Type-erased error returned by intercepted services.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by an interceptor.
pub type InterceptFuture<'a> = BoxFuture<'a, Result<CallOutcome>>;

/// Final stage of a chain: performs the actual call.
type Terminal<'a> = Box<dyn FnOnce(CallContext) -> InterceptFuture<'a> + Send + 'a>;

fn terminal<'a, F, Fut>(handler: F) -> Terminal<'a>
where
    F: FnOnce(CallContext) -> Fut + Send + 'a,
    Fut: Future<Output = Result<CallOutcome>> + Send + 'a,
{
    Box::new(move |ctx: CallContext| -> InterceptFuture<'a> { Box::pin(handler(ctx)) })
}

/// Which end of the connection a chain is installed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Installed on a channel.
    Client,
    /// Installed on a service host.
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Per-call information visible to interceptors.
#[derive(Debug)]
pub struct CallContext {
    method: String,
    side: Side,
    metadata: MetadataMap,
}

impl CallContext {
    /// Create a context for `method` (a path such as `/pkg.Service/Method`).
    pub fn new(method: impl Into<String>, side: Side, metadata: MetadataMap) -> Self {
        Self {
            method: method.into(),
            side,
            metadata,
        }
    }

    /// The full method path.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The fully qualified service name, if the path has one.
    pub fn service(&self) -> Option<&str> {
        let path = self.method.strip_prefix('/')?;
        path.split_once('/').map(|(service, _)| service)
    }

    /// The bare method name, if the path has one.
    pub fn method_name(&self) -> Option<&str> {
        let path = self.method.strip_prefix('/')?;
        path.split_once('/').map(|(_, method)| method)
    }

    /// The side the chain runs on.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Request metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Mutable request metadata. Changes are sent with the call.
    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    fn into_metadata(self) -> MetadataMap {
        self.metadata
    }
}

/// What an interceptor observes once the rest of the chain has returned.
///
/// `code` is present when the status travels in the response headers, which
/// is the case for rejected and failed unary calls. For successful calls the
/// status arrives later in the trailers and `code` is `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallOutcome {
    code: Option<Code>,
    message: Option<String>,
}

impl CallOutcome {
    /// Outcome with the given status code.
    pub fn with_code(code: Code, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: Some(message.into()),
        }
    }

    fn from_headers(headers: &http::HeaderMap) -> Self {
        match Status::from_header_map(headers) {
            Some(status) => Self::with_code(status.code(), status.message()),
            None => Self::default(),
        }
    }

    /// Status code carried in the response headers.
    pub fn code(&self) -> Option<Code> {
        self.code
    }

    /// Status message carried in the response headers.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether the headers reported a non-OK status.
    pub fn is_error(&self) -> bool {
        self.code.is_some_and(|code| code != Code::Ok)
    }
}

/// A stage in an interceptor chain.
///
/// Implementations must either call [`Next::run`] or return an error. An
/// interceptor that returns `Ok` without forwarding is reported to the caller
/// as an `Internal` status.
pub trait Interceptor: Send + Sync + 'static {
    /// Handle one call.
    fn intercept<'a>(&'a self, ctx: CallContext, next: Next<'a>) -> InterceptFuture<'a>;

    /// Name used in logs and debug output.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The remainder of a chain.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    terminal: Terminal<'a>,
}

impl<'a> Next<'a> {
    fn new(chain: &'a [Arc<dyn Interceptor>], terminal: Terminal<'a>) -> Self {
        Self {
            rest: chain,
            terminal,
        }
    }

    /// Forward the call to the next stage.
    pub fn run(self, ctx: CallContext) -> InterceptFuture<'a> {
        match self.rest.split_first() {
            Some((first, rest)) => first.intercept(
                ctx,
                Next {
                    rest,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(ctx),
        }
    }
}

/// An ordered list of interceptors.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Default for InterceptorChain {
    /// Recovery outermost, then logging.
    fn default() -> Self {
        Self::empty()
            .with(RecoveryInterceptor)
            .with(LoggingInterceptor::new())
    }
}

impl InterceptorChain {
    /// A chain with no interceptors.
    pub fn empty() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    /// Build a chain from shared interceptors, in order.
    pub fn from_interceptors(interceptors: impl IntoIterator<Item = Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into_iter().collect(),
        }
    }

    /// Append an interceptor; it runs inside every interceptor already present.
    pub fn with(mut self, interceptor: impl Interceptor) -> Self {
        self.push(Arc::new(interceptor));
        self
    }

    /// Append a shared interceptor.
    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Append every interceptor of `other`.
    pub fn extend(&mut self, other: InterceptorChain) {
        self.interceptors.extend(other.interceptors);
    }

    /// Number of interceptors.
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain has no interceptors.
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Names of the interceptors, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run `ctx` through the chain, ending in `handler`.
    pub async fn execute<'a, F, Fut>(&'a self, ctx: CallContext, handler: F) -> Result<CallOutcome>
    where
        F: FnOnce(CallContext) -> Fut + Send + 'a,
        Fut: Future<Output = Result<CallOutcome>> + Send + 'a,
    {
        Next::new(&self.interceptors, terminal(handler)).run(ctx).await
    }

    pub(crate) fn layer(&self, side: Side) -> InterceptorLayer {
        InterceptorLayer {
            chain: self.interceptors.iter().cloned().collect(),
            side,
        }
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Installs a chain around a service.
#[derive(Clone)]
pub struct InterceptorLayer {
    chain: Arc<[Arc<dyn Interceptor>]>,
    side: Side,
}

impl<S> Layer<S> for InterceptorLayer {
    type Service = InterceptedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptedService {
            inner,
            chain: self.chain.clone(),
            side: self.side,
        }
    }
}

/// A service wrapped by an interceptor chain.
#[derive(Clone)]
pub struct InterceptedService<S> {
    inner: S,
    chain: Arc<[Arc<dyn Interceptor>]>,
    side: Side,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for InterceptedService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    ReqBody: Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // The ready service is the one already in place; leave a fresh clone behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(drive(self.chain.clone(), self.side, inner, req))
    }
}

type Slot = Option<std::result::Result<http::Response<Body>, BoxError>>;

async fn drive<S, ReqBody>(
    chain: Arc<[Arc<dyn Interceptor>]>,
    side: Side,
    mut inner: S,
    req: http::Request<ReqBody>,
) -> std::result::Result<http::Response<Body>, BoxError>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<Body>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    ReqBody: Send + 'static,
{
    let (mut parts, body) = req.into_parts();
    let headers = std::mem::take(&mut parts.headers);
    let ctx = CallContext::new(parts.uri.path(), side, MetadataMap::from_headers(headers));

    let mut slot: Slot = None;
    let result = {
        let slot = &mut slot;
        let send = terminal(move |ctx: CallContext| async move {
            parts.headers = ctx.into_metadata().into_headers();
            let req = http::Request::from_parts(parts, body);
            match inner.call(req).await {
                Ok(response) => {
                    let outcome = CallOutcome::from_headers(response.headers());
                    *slot = Some(Ok(response));
                    Ok(outcome)
                }
                Err(err) => {
                    let err: BoxError = err.into();
                    let message = err.to_string();
                    *slot = Some(Err(err));
                    Err(GrpcError::Dial(message))
                }
            }
        });
        Next::new(&chain, send).run(ctx).await
    };

    match (result, slot) {
        // Transport failures surface unchanged whatever the chain returned.
        (_, Some(Err(err))) => Err(err),
        (Ok(_), Some(Ok(response))) => Ok(response),
        (Err(err), _) => {
            tracing::debug!(target: TARGET, %side, error = %err, "call short-circuited");
            Ok(Status::from(err).into_http())
        }
        (Ok(_), None) => {
            tracing::error!(target: TARGET, %side, "interceptor returned without forwarding the call");
            Ok(Status::internal("interceptor returned without forwarding the call").into_http())
        }
    }
}

/// Logs every call with its duration and resulting code.
#[derive(Clone, Debug, Default)]
pub struct LoggingInterceptor {
    _private: (),
}

impl LoggingInterceptor {
    /// Create a logging interceptor.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interceptor for LoggingInterceptor {
    fn intercept<'a>(&'a self, ctx: CallContext, next: Next<'a>) -> InterceptFuture<'a> {
        Box::pin(async move {
            let method = ctx.method().to_owned();
            let side = ctx.side();
            let start = Instant::now();
            tracing::debug!(target: TARGET, %side, %method, "call started");

            let result = next.run(ctx).await;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            match &result {
                Ok(outcome) if outcome.is_error() => tracing::warn!(
                    target: TARGET,
                    %side,
                    %method,
                    elapsed_ms,
                    code = ?outcome.code(),
                    message = outcome.message().unwrap_or_default(),
                    "call finished with error status"
                ),
                Ok(_) => tracing::info!(target: TARGET, %side, %method, elapsed_ms, "call finished"),
                Err(err) => tracing::warn!(
                    target: TARGET,
                    %side,
                    %method,
                    elapsed_ms,
                    code = ?err.code(),
                    error = %err,
                    "call failed"
                ),
            }
            result
        })
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

/// Turns a panic in any later stage into an `Internal` status.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryInterceptor;

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

impl Interceptor for RecoveryInterceptor {
    fn intercept<'a>(&'a self, ctx: CallContext, next: Next<'a>) -> InterceptFuture<'a> {
        let method = ctx.method().to_owned();
        Box::pin(async move {
            // Calling into the next stage happens inside the guarded future too.
            let rest = async move { next.run(ctx).await };
            match AssertUnwindSafe(rest).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    tracing::error!(target: TARGET, %method, reason, "recovered from panic");
                    Err(GrpcError::rejected(
                        Code::Internal,
                        format!("panic while handling {method}: {reason}"),
                    ))
                }
            }
        })
    }

    fn name(&self) -> &'static str {
        "recovery"
    }
}

/// Adds fixed ASCII metadata to every call.
#[derive(Clone, Debug, Default)]
pub struct MetadataInterceptor {
    entries: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
}

impl MetadataInterceptor {
    /// Create an interceptor with no entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing any value the caller already set for `key`.
    pub fn insert(mut self, key: &str, value: &str) -> Result<Self> {
        let parsed_key = AsciiMetadataKey::from_bytes(key.as_bytes())
            .map_err(|e| GrpcError::InvalidMetadata(format!("key '{}': {}", key, e)))?;
        let parsed_value = AsciiMetadataValue::try_from(value)
            .map_err(|e| GrpcError::InvalidMetadata(format!("value for '{}': {}", key, e)))?;
        self.entries.push((parsed_key, parsed_value));
        Ok(self)
    }
}

impl Interceptor for MetadataInterceptor {
    fn intercept<'a>(&'a self, mut ctx: CallContext, next: Next<'a>) -> InterceptFuture<'a> {
        for (key, value) in &self.entries {
            ctx.metadata_mut().insert(key.clone(), value.clone());
        }
        next.run(ctx)
    }

    fn name(&self) -> &'static str {
        "metadata"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        label: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Interceptor for Recorder {
        fn intercept<'a>(&'a self, ctx: CallContext, next: Next<'a>) -> InterceptFuture<'a> {
            Box::pin(async move {
                self.trace.lock().push(format!("enter {}", self.label));
                let result = next.run(ctx).await;
                self.trace.lock().push(format!("exit {}", self.label));
                result
            })
        }
    }

    struct Reject;

    impl Interceptor for Reject {
        fn intercept<'a>(&'a self, _ctx: CallContext, _next: Next<'a>) -> InterceptFuture<'a> {
            Box::pin(async { Err(GrpcError::rejected(Code::PermissionDenied, "denied")) })
        }
    }

    fn ctx() -> CallContext {
        CallContext::new("/helloworld.Greeter/SayHello", Side::Client, MetadataMap::new())
    }

    async fn record_handler(trace: Arc<Mutex<Vec<String>>>) -> Result<CallOutcome> {
        trace.lock().push("handler".to_string());
        Ok(CallOutcome::default())
    }

    fn explode() -> Result<CallOutcome> {
        panic!("handler blew up")
    }

    #[test]
    fn test_context_path_parts() {
        let ctx = ctx();
        assert_eq!(ctx.service(), Some("helloworld.Greeter"));
        assert_eq!(ctx.method_name(), Some("SayHello"));
        assert_eq!(ctx.side(), Side::Client);

        let bare = CallContext::new("nonsense", Side::Server, MetadataMap::new());
        assert_eq!(bare.service(), None);
        assert_eq!(bare.method_name(), None);
    }

    #[test]
    fn test_default_chain() {
        let chain = InterceptorChain::default();
        assert_eq!(chain.names(), vec!["recovery", "logging"]);
        assert!(InterceptorChain::empty().is_empty());
    }

    #[tokio::test]
    async fn test_ordering() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::empty()
            .with(Recorder {
                label: "A",
                trace: trace.clone(),
            })
            .with(Recorder {
                label: "B",
                trace: trace.clone(),
            });

        for _ in 0..3 {
            trace.lock().clear();
            let handler_trace = trace.clone();
            chain
                .execute(ctx(), move |_ctx| record_handler(handler_trace))
                .await
                .unwrap();
            assert_eq!(
                *trace.lock(),
                vec!["enter A", "enter B", "handler", "exit B", "exit A"]
            );
        }
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::empty()
            .with(Recorder {
                label: "A",
                trace: trace.clone(),
            })
            .with(Reject);

        let handler_trace = trace.clone();
        let err = chain
            .execute(ctx(), move |_ctx| record_handler(handler_trace))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(*trace.lock(), vec!["enter A", "exit A"]);
    }

    #[tokio::test]
    async fn test_recovery_catches_panic() {
        let chain = InterceptorChain::empty().with(RecoveryInterceptor);
        let err = chain
            .execute(ctx(), |_ctx| async { explode() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("handler blew up"));
    }

    #[tokio::test]
    async fn test_metadata_interceptor_sets_headers() {
        let chain = InterceptorChain::empty().with(
            MetadataInterceptor::new()
                .insert("x-api-key", "secret")
                .unwrap(),
        );
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        chain
            .execute(ctx(), move |ctx: CallContext| async move {
                *seen_clone.lock() = ctx
                    .metadata()
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                Ok(CallOutcome::default())
            })
            .await
            .unwrap();
        assert_eq!(seen.lock().as_deref(), Some("secret"));
    }

    #[test]
    fn test_metadata_interceptor_rejects_bad_key() {
        let result = MetadataInterceptor::new().insert("bad key", "v");
        assert!(matches!(result, Err(GrpcError::InvalidMetadata(_))));
    }

    #[test]
    fn test_outcome_error_flag() {
        assert!(!CallOutcome::default().is_error());
        assert!(!CallOutcome::with_code(Code::Ok, "").is_error());
        assert!(CallOutcome::with_code(Code::NotFound, "missing").is_error());
    }
}
