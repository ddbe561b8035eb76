pub mod error;
pub mod models;
pub mod naming;

pub use error::Error;
pub use models::*;
pub use naming::sanitize;
