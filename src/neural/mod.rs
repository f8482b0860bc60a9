//! Value/variance network and its ensemble wrapper.

pub mod ensemble;
pub mod net;

pub use ensemble::{Ensemble, EnsembleConfig};
pub use net::{Net, NetConfig, NetOutput};
