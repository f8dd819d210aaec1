pub mod instance;
pub mod server;

pub use instance::{InstanceService, JobInstance};
pub use server::{ServerService, ServerStatus};

/// Best-effort detection of the address this host uses to reach the network.
pub fn detect_local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not detect host address, using loopback");
            "127.0.0.1".to_string()
        })
}
