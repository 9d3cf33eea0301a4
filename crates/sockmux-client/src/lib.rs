pub mod cache;
pub mod cache_interceptor;
pub mod client;
pub mod config;
pub mod context;
pub mod handler;
pub mod interceptor;
pub mod request_queue;
pub mod router;
pub mod serial;

pub use cache::{CacheEntry, CacheError, CacheManager, CacheServing, CacheStrategy, ExpirePolicy};
pub use cache_interceptor::CacheInterceptor;
pub use client::MuxSocket;
pub use config::{Config, ConfigBuilder, ConfigError};
pub use context::{RequestContext, Tag, FLAG_CHECK_CONNECT_STATUS, FLAG_REQUEST};
pub use handler::{IdentityKey, RequestError, ResponseHandler};
pub use interceptor::{Interceptor, InterceptorChain, ReceiveIntercept, SendIntercept};
pub use request_queue::{NotifySink, RequestQueue};
pub use router::{NotifyRouter, FLAG_SUBSCRIBE_DEFAULT};
pub use serial::SerialSignal;
