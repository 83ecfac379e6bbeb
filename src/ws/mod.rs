pub mod client;

pub use client::{Connector, FrameSource, TungsteniteConnector, WsSession};

#[derive(Debug, Clone)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
}
