use crate::{
    message::{build_reply, RequestMethod, SipEnvelope},
    transport::TransportLayer,
};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::{debug, error, warn};

/// Runs on every inbound envelope before a handler is picked.
pub type RequestMiddleware = Arc<dyn Fn(&mut SipEnvelope) + Send + Sync>;

/// Handles one inbound envelope and optionally returns a reply
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, msg: SipEnvelope) -> Option<SipEnvelope>;
}

/// Inspects or delivers a handler's output
///
/// Returning `true` ends the chain.
#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    async fn process(&self, msg: Option<&mut SipEnvelope>) -> bool;
}

pub struct FnHandler {
    f: Box<dyn Fn(SipEnvelope) -> BoxFuture<'static, Option<SipEnvelope>> + Send + Sync>,
}

#[async_trait]
impl RequestHandler for FnHandler {
    async fn handle(&self, msg: SipEnvelope) -> Option<SipEnvelope> {
        (self.f)(msg).await
    }
}

/// Wrap an async closure into a [`RequestHandler`].
///
/// ```rust,no_run
/// use minisip::{message::build_reply, server::handler_fn};
///
/// let handler = handler_fn(|req| async move { build_reply(&req, 200, "OK").ok() });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(SipEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<SipEnvelope>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: Box::new(move |msg| f(msg).boxed()),
    })
}

/// Default request middleware: give the request a To tag if it has none.
pub fn assign_to_tag(msg: &mut SipEnvelope) {
    if !msg.is_request() {
        return;
    }
    if let Err(e) = msg.ensure_to_tag() {
        debug!("assign To tag failed: {} {}", msg, e);
    }
}

/// Default response middleware: write the reply and end the chain.
pub struct WriteResponse {
    transport_layer: TransportLayer,
}

impl WriteResponse {
    pub fn new(transport_layer: TransportLayer) -> Self {
        Self { transport_layer }
    }
}

#[async_trait]
impl ResponseMiddleware for WriteResponse {
    async fn process(&self, msg: Option<&mut SipEnvelope>) -> bool {
        if let Some(msg) = msg {
            if let Err(e) = self.transport_layer.write(msg).await {
                error!("respond failed: {} {}", msg, e);
            }
        }
        true
    }
}

/// Fallback handler: answer 405 straight away, leave nothing for the chain.
pub struct MethodNotAllowed {
    transport_layer: TransportLayer,
}

impl MethodNotAllowed {
    pub fn new(transport_layer: TransportLayer) -> Self {
        Self { transport_layer }
    }
}

#[async_trait]
impl RequestHandler for MethodNotAllowed {
    async fn handle(&self, msg: SipEnvelope) -> Option<SipEnvelope> {
        warn!(
            method = %msg.dispatch_method(),
            source = %msg.source,
            "SIP request handler not found"
        );
        let mut reply = match build_reply(&msg, 405, "Method Not Allowed") {
            Ok(reply) => reply,
            Err(e) => {
                debug!("no 405 for {}: {}", msg, e);
                return None;
            }
        };
        reply.set_body(vec![]);
        if let Err(e) = self.transport_layer.write(&reply).await {
            error!("respond '405 Method Not Allowed' failed: {}", e);
        }
        None
    }
}

/// Request middlewares, handler table and response middlewares
///
/// Slot 0 of the request chain holds [`assign_to_tag`] and the last slot of
/// the response chain holds [`WriteResponse`]; both can be replaced. Added
/// response middlewares are placed ahead of the default one so they see the
/// reply before it is written.
pub struct Router {
    request_middlewares: Vec<RequestMiddleware>,
    handlers: HashMap<RequestMethod, Arc<dyn RequestHandler>>,
    fallback: Arc<dyn RequestHandler>,
    response_middlewares: Vec<Arc<dyn ResponseMiddleware>>,
}

impl Router {
    pub fn new(transport_layer: TransportLayer) -> Self {
        Router {
            request_middlewares: vec![Arc::new(assign_to_tag) as RequestMiddleware],
            handlers: HashMap::new(),
            fallback: Arc::new(MethodNotAllowed::new(transport_layer.clone())),
            response_middlewares: vec![
                Arc::new(WriteResponse::new(transport_layer)) as Arc<dyn ResponseMiddleware>
            ],
        }
    }

    pub fn on(&mut self, method: RequestMethod, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(method, handler);
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn RequestHandler>) {
        self.fallback = handler;
    }

    pub fn add_request_middleware(&mut self, middleware: RequestMiddleware) {
        self.request_middlewares.push(middleware);
    }

    pub fn replace_default_request_middleware(&mut self, middleware: RequestMiddleware) {
        self.request_middlewares[0] = middleware;
    }

    pub fn add_response_middleware(&mut self, middleware: Arc<dyn ResponseMiddleware>) {
        let at = self.response_middlewares.len() - 1;
        self.response_middlewares.insert(at, middleware);
    }

    pub fn replace_default_response_middleware(&mut self, middleware: Arc<dyn ResponseMiddleware>) {
        let last = self.response_middlewares.len() - 1;
        self.response_middlewares[last] = middleware;
    }

    /// Handler registered for `method`, or the fallback.
    pub fn handler_for(&self, method: &RequestMethod) -> Arc<dyn RequestHandler> {
        self.handlers
            .get(method)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Run one envelope through the pipeline
    ///
    /// Nothing is returned: a reply reaches the peer only through the
    /// response middlewares.
    pub async fn handle_request(&self, mut msg: SipEnvelope) {
        for middleware in &self.request_middlewares {
            middleware(&mut msg);
        }

        let method = msg.dispatch_method();
        debug!("dispatching {} from {}", method, msg.source);
        let handler = self.handler_for(&method);
        let mut reply = handler.handle(msg).await;

        for middleware in &self.response_middlewares {
            if middleware.process(reply.as_mut()).await {
                break;
            }
        }
    }
}
