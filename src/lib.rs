//! Syncflight: single-flight synchronization and exclusive task coordination
//! for Tokio.
//!
//! Interactive applications fire many concurrent "reload" and "sync"
//! requests at the same logical unit of work. Syncflight guarantees
//! at-most-one concurrent execution per unit, correct cancellation of
//! superseded work, and a single consistent outcome for every caller,
//! original or joined: [`Mutator`] is the two-lane exclusion and
//! cancellation engine, [`SingleFlight`]/[`KeyedSingleFlight`] collapse
//! concurrent identical operations, [`Loader`] adds observable load state,
//! and [`WaiterGroup`]/[`KeyedState`] are the broadcast primitives they are
//! built on.

pub mod affinity;
pub mod error;
pub mod events;
pub mod keyed_single_flight;
pub mod keyed_state;
pub mod loader;
pub mod mutator;
pub mod single_flight;
pub mod state;
pub mod waiters;

pub use affinity::Affinity;
pub use error::{Error, Result};
pub use events::{EventBus, EventStream};
pub use keyed_single_flight::KeyedSingleFlight;
pub use keyed_state::{KeyedState, Observation};
pub use loader::{LoadScope, LoadState, Loader};
pub use mutator::{Lane, Mutator};
pub use single_flight::SingleFlight;
pub use state::StateCell;
pub use waiters::WaiterGroup;
