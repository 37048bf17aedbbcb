pub mod data;
pub mod enrich;
pub mod store;
pub mod stream;
pub mod view;

pub use data::{HistoryBuffer, ParsedRecord, RawLine};
pub use enrich::Resolver;
pub use store::{PersistedState, StateStore};
pub use stream::{Batcher, Ingestor, Sinks};
pub use view::LogView;
