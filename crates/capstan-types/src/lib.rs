pub mod fleet;
pub mod github;
pub mod instance;
pub mod message;
pub mod scope;

pub use fleet::*;
pub use github::*;
pub use instance::*;
pub use message::*;
pub use scope::*;
