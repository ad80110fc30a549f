pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod session;
pub mod stream;
pub mod stream_id;

pub use codec::Codec;
pub use config::{Config, ConfigBuilder};
pub use error::{Result, YamuxError};
pub use frame::{
    Flags, Frame, FrameHeader, FrameType, HEADER_SIZE, INITIAL_WINDOW_SIZE, PROTOCOL_VERSION,
};
pub use session::{Session, SessionEvent};
pub use stream::{Stream, StreamState};
pub use stream_id::StreamIdGenerator;
