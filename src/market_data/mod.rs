pub mod candle_buffer;
pub mod stream_manager;

// Re-export the market-data types for convenient access
// (e.g. `use crate::market_data::Candle`).
pub use candle_buffer::{Candle, CandleBuffer, CandleKey};
pub use stream_manager::{ConnState, StreamManager, StreamSettings};
