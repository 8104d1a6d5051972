pub mod clock;
pub mod config;
pub mod error;
pub mod shutdown;
pub mod state;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use shutdown::*;
pub use state::*;
