pub mod backoff;
pub mod stream;
