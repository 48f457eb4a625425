pub mod accounts;
pub mod health;
pub mod orchestrator;
pub mod sync;
pub mod webhook;

pub use accounts::*;
pub use health::*;
pub use orchestrator::*;
pub use sync::*;
pub use webhook::*;
