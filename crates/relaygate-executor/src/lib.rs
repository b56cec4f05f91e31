pub mod executor;
pub mod portal;
pub mod session;

pub use executor::{CommandExecutor, FetchResult};
pub use portal::{Fetched, Portal, ResponseType};
pub use session::Session;

#[cfg(test)]
mod tests;
