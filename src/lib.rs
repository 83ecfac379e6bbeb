pub mod backfill;
pub mod config;
pub mod exchange;
pub mod schema;
pub mod stream;
pub mod util;
pub mod writer;
pub mod ws;
