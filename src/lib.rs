pub mod api;
pub mod attachment;
pub mod chat;
pub mod cli;
pub mod console;
pub mod error;
pub mod models;
pub mod session;
pub mod socket;
pub mod vault;

use api::ApiClient;
use cli::Args;
use log::{ info, warn };
use session::Session;
use models::voucher::VoucherFilters;
use socket::{ SocketClient, SocketConfig };
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let socket_origin = args.socket_origin()?;

    info!("--- Client Configuration ---");
    info!("API URL: {}", args.api_url);
    info!("Socket Origin: {}", socket_origin);
    info!("Socket Path: {}", args.socket_path);
    info!("Socket Namespace: {}", args.socket_namespace);
    info!("Connect Timeout: {}s", args.connect_timeout_secs);
    info!("Event Buffer: {}", args.event_buffer);
    info!("Voucher Page Size: {}", args.voucher_limit);
    info!("----------------------------");

    let mut socket_config = SocketConfig::new(&socket_origin)?
        .with_path(&args.socket_path)
        .with_namespace(&args.socket_namespace);
    socket_config.connect_timeout = Duration::from_secs(args.connect_timeout_secs);
    socket_config.event_buffer = args.event_buffer;

    let api = Arc::new(ApiClient::new(args.api_url.clone()));
    let transport = Arc::new(SocketClient::new(socket_config));
    let session = Session::start(api, transport).await;

    session.vault().load_insights().await;
    if let Err(e) = session
        .vault()
        .load_vouchers(&VoucherFilters::limit(args.voucher_limit)).await
    {
        warn!("Initial voucher load failed: {}", e);
    }

    let result = console::run(&session, args.voucher_limit).await;
    session.shutdown().await;
    result
}
