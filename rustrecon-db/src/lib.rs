mod actions;
mod clock;
mod config;
mod creds;
mod error;
mod hosts;
mod presence;
mod queue;
pub mod rolling;
mod schema;
mod services;
mod software;
mod stats;
mod store;
mod view;
mod vulns;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use error::DbError;
pub use hosts::MergeOutcome;
pub use queue::format_status_id;
pub use rolling::SetDiff;
pub use store::{Store, default_db_path};
pub use view::ReadView;
