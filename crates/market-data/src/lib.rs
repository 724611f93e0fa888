pub mod cache;
pub mod history;
pub mod stream;

pub use cache::QuoteCache;
pub use history::HistoryProvider;
pub use stream::StreamManager;
