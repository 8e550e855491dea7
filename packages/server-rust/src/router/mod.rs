//! Packet routing: a middleware chain plus a match table.
//!
//! Dispatch runs the middleware chain through the context's cursor, then,
//! unless a middleware aborted, the handler matched on the packet type,
//! and for command packets also the handler matched on the command name.

mod context;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use courier_core::packets::{Packet, PacketType};

pub use context::MContext;
pub(crate) use context::{ContextPool, ABORT_INDEX};

/// Boxed future returned by handlers; borrows the context it works on.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A packet handler or middleware.
///
/// Stateful handlers implement this directly; plain
/// `fn(&mut MContext) -> HandlerFuture<'_>` functions go through
/// [`handler_fn`].
pub trait Handler: Send + Sync {
    fn call<'a>(&'a self, ctx: &'a mut MContext) -> HandlerFuture<'a>;
}

/// Adapter giving plain handler functions a [`Handler`] impl.
struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut MContext) -> HandlerFuture<'a> + Send + Sync,
{
    fn call<'a>(&'a self, ctx: &'a mut MContext) -> HandlerFuture<'a> {
        (self.0)(ctx)
    }
}

/// Wrap a handler function for registration.
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(&'a mut MContext) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Key into the router's match table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchKey {
    /// Matched on the packet type in the fixed header.
    Type(PacketType),
    /// Matched on the command name of a `Cmd` packet.
    Cmd(String),
}

/// Middleware chain plus match table.
///
/// Built once at startup and immutable while serving.
pub struct Router {
    chain: Arc<[Arc<dyn Handler>]>,
    matches: HashMap<MatchKey, Arc<dyn Handler>>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chain: Arc::from(Vec::<Arc<dyn Handler>>::new()),
            matches: HashMap::new(),
        }
    }

    /// Append a middleware to the chain.
    pub fn middleware(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        debug_assert!(
            self.chain.len() + 1 < ABORT_INDEX as usize,
            "middleware chain exceeds the abort sentinel"
        );
        let mut chain: Vec<Arc<dyn Handler>> = self.chain.to_vec();
        chain.push(handler);
        self.chain = Arc::from(chain);
        self
    }

    /// Register the handler for a match key, replacing any previous one.
    pub fn route(&mut self, key: MatchKey, handler: Arc<dyn Handler>) -> &mut Self {
        self.matches.insert(key, handler);
        self
    }

    /// The current middleware chain, shared with routing contexts.
    pub(crate) fn chain(&self) -> Arc<[Arc<dyn Handler>]> {
        Arc::clone(&self.chain)
    }

    /// Dispatch one routing context.
    pub async fn serve(&self, ctx: &mut MContext) {
        ctx.next().await;
        if ctx.is_aborted() {
            return;
        }

        if let Some(handler) = self.matches.get(&MatchKey::Type(ctx.packet_type())) {
            let handler = Arc::clone(handler);
            handler.call(ctx).await;
        }

        let cmd_key = match ctx.packet() {
            Packet::Cmd(cmd) => Some(MatchKey::Cmd(cmd.cmd.clone())),
            _ => None,
        };
        if let Some(key) = cmd_key {
            if let Some(handler) = self.matches.get(&key) {
                let handler = Arc::clone(handler);
                handler.call(ctx).await;
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
