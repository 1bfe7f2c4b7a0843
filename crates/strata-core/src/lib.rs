//! Domain types shared by every Strata crate: the level hierarchy, contexts,
//! version records, change events, the error taxonomy, settings and the
//! persistence traits.

pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod level;
pub mod settings;
pub mod store;
pub mod version;

pub use context::{Change, Context, DeleteRequest, Lineage, Payload, PutRequest};
pub use errors::{BatchFailure, ContextError, Result};
pub use events::{ChangeEvent, ChangeEventType};
pub use ids::{BatchId, EventId, Principal, SubscriptionId};
pub use level::{ContextKey, Level, GLOBAL_CONTEXT_ID};
pub use settings::StrataSettings;
pub use store::{ContextStore, StagedWrite, TransactionError, VersionLog};
pub use version::{ChangeType, ContextDiff, ValueChange, VersionRecord};
