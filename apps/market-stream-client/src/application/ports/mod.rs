//! Application Ports
//!
//! - **Driven Ports** (Secondary/Outbound): `MarketStreamPort`, the shared
//!   stream connection that services subscribe and listen through.

mod market_stream_port;

pub use market_stream_port::{MarketStreamError, MarketStreamPort};
