pub mod cache;
pub mod coordinator;
pub mod error;
pub mod frames;
pub mod session;
pub mod tags;

pub use cache::SessionCache;
pub use coordinator::StreamCoordinator;
pub use frames::SseFrame;
pub use session::{mint_stream_token, StreamSession};
