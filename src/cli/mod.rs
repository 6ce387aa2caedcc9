use clap::Parser;
use url::Url;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Backend Args ---
    /// Base URL of the REST API, including any prefix (e.g., http://localhost:3000/api)
    #[arg(long, env = "API_URL", default_value = "http://localhost:3000/api")]
    pub api_url: String,

    // --- Socket Args ---
    /// Origin of the Socket.IO server. Defaults to the origin of API_URL.
    #[arg(long, env = "SOCKET_URL")]
    pub socket_url: Option<String>,

    /// Engine.IO mount path on the socket server.
    #[arg(long, env = "SOCKET_PATH", default_value = "/socket.io")]
    pub socket_path: String,

    /// Socket.IO namespace carrying chat events.
    #[arg(long, env = "SOCKET_NAMESPACE", default_value = "/chat")]
    pub socket_namespace: String,

    /// Seconds to wait for the socket handshake before giving up.
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Capacity of the inbound chat event buffer.
    #[arg(long, env = "EVENT_BUFFER", default_value = "256")]
    pub event_buffer: usize,

    // --- General App Args ---
    /// Page size used when listing vouchers.
    #[arg(long, env = "VOUCHER_LIMIT", default_value = "20")]
    pub voucher_limit: u32,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    /// `SOCKET_URL` if set, otherwise scheme, host and port of `API_URL`.
    pub fn socket_origin(&self) -> Result<String, url::ParseError> {
        if let Some(url) = self.socket_url.as_ref().filter(|u| !u.trim().is_empty()) {
            return Ok(url.clone());
        }
        let api = Url::parse(&self.api_url)?;
        Ok(api.origin().ascii_serialization())
    }
}
