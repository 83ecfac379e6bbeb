pub mod binance_kline_ws;
pub mod binance_rest;
