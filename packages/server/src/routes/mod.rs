mod awakeables;
mod health;

pub use awakeables::{reject_handler, resolve_handler};
pub use health::health_handler;
