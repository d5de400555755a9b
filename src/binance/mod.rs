pub mod client;
pub mod models;

pub use client::VenueClient;
pub use models::{NewOrderRequest, OpenOrder, OrderAck, PositionRisk, SymbolFilters};
