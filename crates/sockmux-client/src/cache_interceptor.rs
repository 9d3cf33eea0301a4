use crate::cache::CacheManager;
use crate::context::RequestContext;
use crate::interceptor::{Interceptor, ReceiveIntercept, SendIntercept};
use sockmux_core::Packet;
use std::sync::Arc;
use tracing::{debug, error};

/// Serves responses from the cache before they reach the connection and
/// stores responses into the cache as they arrive.
pub struct CacheInterceptor {
    cache: Arc<CacheManager>,
}

impl CacheInterceptor {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }
}

impl Interceptor for CacheInterceptor {
    fn pre_send(&self, context: &RequestContext) -> SendIntercept {
        let Some(serving) = self.cache.lookup_serving(context.command()) else {
            return SendIntercept::Continue;
        };
        if serving.stale {
            debug!(
                event = "cache_serve_stale",
                command = context.command(),
                context_id = context.id()
            );
            SendIntercept::ServeStale(serving.packet)
        } else {
            debug!(
                event = "cache_hit",
                command = context.command(),
                context_id = context.id()
            );
            SendIntercept::Serve(serving.packet)
        }
    }

    fn post_receive(&self, command: i32, packet: &Packet) -> ReceiveIntercept {
        match self.cache.update(command, packet.clone()) {
            Ok(true) => debug!(event = "cache_updated", command),
            Ok(false) => {}
            // a mismatched packet is a protocol bug in the caller's codec;
            // it must not take down the chain
            Err(err) => error!(event = "cache_update_rejected", command, error = %err),
        }
        ReceiveIntercept::Continue
    }
}
