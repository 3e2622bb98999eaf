pub mod audit;
pub mod backup;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod importer;
pub mod legacy;
pub mod mapper;
pub mod model;
pub mod reconcile;
pub mod schema;
pub mod store;

pub use config::ImportConfig;
pub use db::SqliteStore;
pub use error::{ImportError, RecordError};
pub use importer::{CancelFlag, ImportRequest, Importer};
pub use model::{EntityType, ImportOutcome, ImportSummary, OutcomeStatus};
pub use store::ImportStore;
