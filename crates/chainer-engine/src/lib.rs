//! Bundle engine: detects packages, plans a run and applies it, forwarding
//! per-machine work to an elevated worker.

mod elevated;
mod engine;
mod observer;

pub use elevated::{serve_elevated, ElevatedWorker};
pub use engine::{Engine, ELEVATION_PIPE_PREFIX};
pub use observer::{ApplyResult, EngineObserver, ErrorResponse, NullObserver, RestartState};
