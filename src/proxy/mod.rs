mod pool;
mod proxy;

pub use pool::{ConnectionPool, HttpClient, POOL_CAPACITY};
pub use proxy::{
    ProxyError, ProxyRule, UpstreamCategory, CREDENTIAL_HEADERS, X_FORWARDED_FOR,
    X_FORWARDED_HOST, X_FORWARDED_PROTO, X_UPSTREAM_ERROR,
};
