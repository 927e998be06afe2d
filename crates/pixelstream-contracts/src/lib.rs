pub mod conversations;
pub mod events;
pub mod grounding;
pub mod request;
