pub mod events;
pub mod kind;
