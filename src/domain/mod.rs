//! Domain layer: models, errors and the ports other layers implement.

pub mod error;
pub mod models;
pub mod ports;
