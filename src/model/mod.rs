//! Model catalog.
//!
//! The set of servable variants is fixed at build time; the runtime only
//! ever receives the descriptor of the variant chosen at startup.

pub mod registry;

pub use registry::{lookup, Modality, ModelDescriptor};
