//! Concrete probes for each deployment stage

pub mod server;
pub mod services;
pub mod ssh;
pub mod tls;

pub use server::ServerRunningProbe;
pub use services::ServicesRunningProbe;
pub use ssh::SshReadyProbe;
pub use tls::{inspect_certificate, TlsCertProbe, TlsError};
