pub mod config;
pub mod error;
pub mod event;
pub mod io;
pub mod session;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, StrandError};
pub use event::{EventBus, WorkflowEvent};
pub use io::{PreviousOutputs, SessionState, StepInput, StepOutput};
pub use session::WorkflowSession;
pub use types::*;
