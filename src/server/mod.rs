//! Dispatch pipeline
//!
//! [`Server`] owns a [`TransportLayer`] and a [`Router`]. Every envelope the
//! transport layer accepts is queued on a bounded channel; a dispatch task
//! takes it from there and runs [`Router::handle_request`] on a task of its
//! own, with at most [`ServerConfig::max_concurrency`] of them in flight.
//!
//! Registration (`on_*`, middlewares, fallback) must happen before the
//! first `listen`/`serve_udp` call. Afterwards the router is shared with the
//! dispatch task and registration is ignored with a warning.
//!
//! ```rust,no_run
//! use minisip::{
//!     message::build_reply,
//!     server::{handler_fn, Server, ServerConfig},
//! };
//!
//! # async fn example() -> minisip::Result<()> {
//! let mut server = Server::new(ServerConfig::default());
//! server.on_invite(handler_fn(|req| async move {
//!     let mut reply = build_reply(&req, 200, "OK").ok()?;
//!     reply.set_body(vec![]);
//!     Some(reply)
//! }));
//! server.listen_and_serve("udp", "127.0.0.1:5060").await
//! # }
//! ```
use crate::{
    message::{RequestMethod, SipEnvelope},
    transport::{TransportConfig, TransportEvent, TransportLayer, TransportReceiver},
    Result,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{net::UdpSocket, select, sync::Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod router;
pub use router::{
    assign_to_tag, handler_fn, FnHandler, MethodNotAllowed, RequestHandler, RequestMiddleware,
    ResponseMiddleware, Router, WriteResponse,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    /// Envelopes queued between the read loops and the dispatch task.
    pub channel_capacity: usize,
    /// Handler executions allowed to run at the same time.
    pub max_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            transport: TransportConfig::default(),
            channel_capacity: 1024,
            max_concurrency: 256,
        }
    }
}

impl ServerConfig {
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }
}

pub struct Server {
    config: ServerConfig,
    transport_layer: TransportLayer,
    router: Arc<Router>,
    cancel_token: CancellationToken,
    serving: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let cancel_token = CancellationToken::new();
        let transport_layer =
            TransportLayer::new(cancel_token.child_token(), config.transport.clone());
        let router = Arc::new(Router::new(transport_layer.clone()));
        Server {
            config,
            transport_layer,
            router,
            cancel_token,
            serving: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The transport layer, e.g. to register another transport.
    pub fn transport_layer(&self) -> &TransportLayer {
        &self.transport_layer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    fn router_mut(&mut self) -> Option<&mut Router> {
        let router = Arc::get_mut(&mut self.router);
        if router.is_none() {
            warn!("server is serving, registration ignored");
        }
        router
    }

    pub fn on(&mut self, method: RequestMethod, handler: Arc<dyn RequestHandler>) {
        if let Some(router) = self.router_mut() {
            router.on(method, handler);
        }
    }

    pub fn on_invite(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Invite, handler)
    }

    pub fn on_ack(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Ack, handler)
    }

    pub fn on_cancel(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Cancel, handler)
    }

    pub fn on_bye(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Bye, handler)
    }

    pub fn on_register(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Register, handler)
    }

    pub fn on_options(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Options, handler)
    }

    pub fn on_subscribe(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Subscribe, handler)
    }

    pub fn on_notify(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Notify, handler)
    }

    pub fn on_refer(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Refer, handler)
    }

    pub fn on_info(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Info, handler)
    }

    pub fn on_message(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Message, handler)
    }

    pub fn on_prack(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Prack, handler)
    }

    pub fn on_update(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Update, handler)
    }

    pub fn on_publish(&mut self, handler: Arc<dyn RequestHandler>) {
        self.on(RequestMethod::Publish, handler)
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn RequestHandler>) {
        if let Some(router) = self.router_mut() {
            router.set_fallback(handler);
        }
    }

    pub fn add_request_middleware(&mut self, middleware: RequestMiddleware) {
        if let Some(router) = self.router_mut() {
            router.add_request_middleware(middleware);
        }
    }

    pub fn replace_default_request_middleware(&mut self, middleware: RequestMiddleware) {
        if let Some(router) = self.router_mut() {
            router.replace_default_request_middleware(middleware);
        }
    }

    pub fn add_response_middleware(&mut self, middleware: Arc<dyn ResponseMiddleware>) {
        if let Some(router) = self.router_mut() {
            router.add_response_middleware(middleware);
        }
    }

    pub fn replace_default_response_middleware(&mut self, middleware: Arc<dyn ResponseMiddleware>) {
        if let Some(router) = self.router_mut() {
            router.replace_default_response_middleware(middleware);
        }
    }

    /// Bind `addr` on `network` and start dispatching what arrives there.
    pub async fn listen(&self, network: &str, addr: &str) -> Result<SocketAddr> {
        let local = self.transport_layer.listen(network, addr).await?;
        self.start_dispatch().await;
        info!("listening on {} {}", network, local);
        Ok(local)
    }

    /// Like [`Server::listen`], then wait until the server is closed.
    pub async fn listen_and_serve(&self, network: &str, addr: &str) -> Result<()> {
        self.listen(network, addr).await?;
        self.cancel_token.cancelled().await;
        Ok(())
    }

    /// Serve an already bound UDP socket.
    pub async fn serve_udp(&self, socket: UdpSocket) -> Result<SocketAddr> {
        let local = self.transport_layer.serve_udp(socket).await?;
        self.start_dispatch().await;
        info!("serving udp {}", local);
        Ok(local)
    }

    /// Send `msg` through the transport layer without a transaction.
    pub async fn write_response(&self, msg: &SipEnvelope) -> Result<()> {
        self.transport_layer.write(msg).await
    }

    pub async fn close(&self) -> Result<()> {
        self.cancel_token.cancel();
        self.transport_layer.close().await
    }

    async fn start_dispatch(&self) {
        if self.serving.swap(true, Ordering::SeqCst) {
            return;
        }
        let (sender, receiver) = tokio::sync::mpsc::channel(self.config.channel_capacity);
        self.transport_layer.append_handler(sender).await;
        tokio::spawn(dispatch_loop(
            self.router.clone(),
            receiver,
            Arc::new(Semaphore::new(self.config.max_concurrency)),
            self.cancel_token.child_token(),
        ));
    }
}

async fn dispatch_loop(
    router: Arc<Router>,
    mut receiver: TransportReceiver,
    semaphore: Arc<Semaphore>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = select! {
            _ = cancel_token.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let msg = match event {
            TransportEvent::Incoming(msg) => msg,
            TransportEvent::Closed(key) => {
                debug!("connection closed: {}", key);
                continue;
            }
        };
        let permit = select! {
            _ = cancel_token.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let router = router.clone();
        tokio::spawn(async move {
            router.handle_request(msg).await;
            drop(permit);
        });
    }
    debug!("dispatch loop exited");
}
