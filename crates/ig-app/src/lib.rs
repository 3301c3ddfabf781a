pub mod daily;
pub mod error;
pub mod events;
pub mod generator;

pub use error::BackendError;
pub use events::{BatchEvent, EventSender};
pub use generator::Generator;
