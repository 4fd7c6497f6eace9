pub mod http;

pub use http::RetryPolicy;
