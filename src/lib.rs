pub mod collaborators;
pub mod config;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod sanction;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod token;
pub mod types;
pub mod utils;
pub mod variant;

pub use config::Config;
pub use error::{SanctionError, SanctionResult};
pub use sanction::{ApprovalMode, Sanction, SanctionState};
pub use scheduler::{ExpiryScheduler, SweepReport};
pub use service::{Collaborators, SanctionService};
pub use token::{TokenIssuer, TokenKind};
pub use variant::{SanctionKind, Variant};
