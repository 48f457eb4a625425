pub mod account;
pub mod payload;
pub mod terminal;
pub mod trade;

pub use account::*;
pub use payload::*;
pub use terminal::*;
pub use trade::*;
