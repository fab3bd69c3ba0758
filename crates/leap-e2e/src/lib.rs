//! End-to-end test utilities for the Leap tunnel system
//!
//! Runs a real relay server on an ephemeral port, real client sessions and
//! small local services for them to forward to.

pub mod harness;
pub mod mock_service;
pub mod test_client;

pub use harness::TestServer;
pub use mock_service::{MockHttpService, RawService, SilentService};
pub use test_client::TestClient;
