//! recon-core: diff-and-converge engine for remote-managed resources.
//!
//! A resource kind plugs into the engine by implementing [`ResourceManager`].
//! The [`Reconciler`] then runs one convergence pass at a time:
//! observe → create or diff → sync tags → sync sub-collections → update the
//! primary record → derive conditions → hand back an [`Outcome`] for the
//! external scheduler.
//!
//! The building blocks are usable on their own:
//! - [`diff`]: natural-key set difference
//! - [`tags`]: add/remove tag synchronisation
//! - [`collection`]: per-item attach/detach synchronisation
//! - [`page`]: continuation-token pagination
//! - [`condition`]: upsert-by-type status conditions

pub mod collection;
pub mod condition;
pub mod context;
pub mod delta;
pub mod diff;
pub mod error;
pub mod outcome;
pub mod page;
pub mod reconciler;
pub mod tags;
pub mod token;

pub use collection::{Progress, SubCollection, SyncProgress, sync_collection};
pub use condition::{Condition, ConditionType, Conditions};
pub use context::{CallContext, CancelHandle};
pub use delta::{Delta, DeltaBuilder};
pub use diff::{CollectionDiff, diff};
pub use error::{Error, NOT_FOUND_CODE, Result, Severity};
pub use outcome::Outcome;
pub use page::{Page, PageSource, Pages};
pub use reconciler::{
    Applied, Changes, Reconciled, Reconciler, ReconcilerConfig, ResourceManager, TAGS_PATH,
};
pub use tags::{Tag, TagClient, TagDiff, Tags, fetch_tags, sync_tags, tag_diff};
pub use token::RequestToken;
