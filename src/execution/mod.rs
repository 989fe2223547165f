//! Order execution: state machine, backends, and the execution manager.

mod backend;
mod live;
mod manager;
mod order;
mod paper;

pub use backend::{ExecutionBackend, ExecutionEvent};
pub use live::LiveBackend;
pub use manager::{ExecutionManager, ExecutionOutcome};
pub use order::{ExecutionError, Order, OrderIntent, OrderState};
pub use paper::{PaperBackend, PaperConfig};
