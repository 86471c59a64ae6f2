pub mod host;
pub mod limiter;
pub mod logging;
pub mod request;
pub mod session;
