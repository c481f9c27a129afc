//! Minimal multicast streams every model node exposes its state through.
//!
//! [`EventStream`] forwards emissions to whoever is subscribed at the time of
//! emission. [`StateStream`] additionally holds a current value and replays it
//! to each new subscriber. Every subscription is a [`Subscription`] guard that
//! releases the listener when dropped.

mod event;
mod state;

pub use event::{Changes, EventStream, Subscription};
pub use state::StateStream;
