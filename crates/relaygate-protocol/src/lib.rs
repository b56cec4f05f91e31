pub mod backend;
mod codec;
pub mod frontend;
pub mod messages;

pub use messages::BackendMessage;
pub use messages::FrontendMessage;
