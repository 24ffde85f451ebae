pub mod client;
pub mod error;
pub mod gateway;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use vidlink_protocol as protocol;
