pub mod helpers;
pub mod handlers;
pub mod store;

pub use helpers::*;
pub use handlers::*;
pub use store::*;
