pub mod error;
pub mod models;
pub mod services;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
