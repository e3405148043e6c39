pub mod gate;
pub mod key;
pub mod memstore;
pub mod metrics;
pub mod pgstore;
pub mod store;

/// A decoded input record: an open-ended JSON object, kept in the order its fields were read.
pub type Record = serde_json::Map<String, serde_json::Value>;
