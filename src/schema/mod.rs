pub mod kline;
pub mod mapper;
