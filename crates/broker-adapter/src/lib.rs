pub mod fake;
pub mod retry;
pub mod types;
pub mod upstox;

pub use fake::FakeBroker;
pub use retry::with_retry;
pub use types::{
    AdapterError, AdapterResult, BrokerAdapter, BrokerOrderRequest, OrderPatch, QuoteTick,
};
pub use upstox::UpstoxAdapter;
