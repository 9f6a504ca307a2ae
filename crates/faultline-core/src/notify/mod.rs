pub mod events;
pub mod gate;
pub mod recipients;
pub mod watchers;
