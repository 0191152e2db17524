// timer/mod.rs

pub mod accountant;
pub mod dispatcher;
pub mod engine;
pub mod wait_gate;

pub use accountant::{admission_window, TickStats};
pub use dispatcher::{TickCallback, TickEvent, TickSubscriber};
pub use engine::{Timer, TimerBuilder, TimerState};
pub use wait_gate::WaitGate;
