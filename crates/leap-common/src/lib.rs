mod error;
mod signal;
mod tls;

pub use error::TransportError;
pub use signal::shutdown_signal;
pub use tls::{load_certs_from_pem, load_private_key_from_pem, load_server_config};
