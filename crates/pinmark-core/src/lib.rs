//! Pinmark Core Library
//!
//! The collaborative annotation engine behind Pinmark: freehand curve capture
//! and rasterization, the mask push/apply protocol, the positional comment
//! store, and the realtime dispatcher that binds a session to its live channel.

pub mod api;
pub mod channel;
pub mod comments;
pub mod config;
pub mod curve;
pub mod debounce;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod mask;
pub mod protocol;
pub mod raster;
pub mod session;
pub mod storage;

pub use api::{
    ApiCompletion, ApiError, ApiRequest, HttpApi, ImageApi, MemoryApi, MemoryApiHandle, RequestKind,
    Upload,
};
pub use channel::{
    ChannelError, ChannelEvent, ConnectionState, LiveChannel, MemoryChannel, MemoryChannelHandle,
    WsChannel,
};
pub use comments::{AnchorKey, CloseOutcome, CommentEvent, CommentStore, CommentThread, Message};
pub use config::{ConfigError, EngineConfig, Endpoints};
pub use curve::{BrushColor, Curve, CurveRenderer, StrokeState};
pub use debounce::Debouncer;
pub use dispatcher::{Backoff, DispatchEvent, Dispatcher, RouteTargets, dispatch};
pub use error::{SessionError, SessionResult};
pub use link::{session_id_from_link, share_link};
pub use mask::{BackgroundLayer, MaskSnapshot, MaskSync};
pub use protocol::{CommentRecord, ImageSnapshot, ProtocolError, RemoteEvent, WireEvent, decode_event};
pub use raster::{Pixmap, RasterError, Surface};
pub use session::{PointerMode, Session, SessionContext, SessionController, SessionNotice};
pub use storage::{
    FileSessionStore, MemorySessionStore, RememberedSession, SessionMemory, StorageError,
};
