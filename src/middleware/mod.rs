pub mod request_logger;

pub use request_logger::{request_logger, RequestLogging};
