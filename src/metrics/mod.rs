//! Metrics for a pipeline run.
//!
//! - `events`: event types and the `InternalEvent` trait
//! - `server`: optional Prometheus HTTP endpoint

pub mod events;
pub mod server;

pub use server::init;

/// Emit an internal event.
///
/// ```ignore
/// use yellowcab::metrics::events::RowsTransformed;
///
/// emit!(RowsTransformed { count: 1_369_765 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
