pub mod chat;
pub mod voucher;
pub mod websocket;
