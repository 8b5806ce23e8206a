// src/market/mod.rs
pub mod master;
pub mod prices;

pub use master::{HttpSecuritiesMaster, SecuritiesMaster, SecurityRecord};
pub use prices::{Candle, CandleSource, HttpCandleSource};
