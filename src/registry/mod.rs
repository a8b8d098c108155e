//! Stream registry
//!
//! The process-wide index of actively publishing streams. It is an
//! explicitly constructed value owned by the composition root, never a
//! global, and shared by reference with the publish controller, the
//! ingest connections, and the HTTP surface.
//!
//! ```text
//!                       Arc<StreamRegistry>
//!                  ┌───────────────────────────┐
//!                  │ RwLock<HashMap<StreamKey, │
//!                  │   Arc<StreamRecord> {     │
//!                  │     state: AtomicU8,      │
//!                  │     counters: atomics,    │
//!                  │     relay: broadcast + GOP│
//!                  │   }                       │
//!                  │ >>                        │
//!                  └─────────────┬─────────────┘
//!                                │
//!            ┌───────────────────┼────────────────────┐
//!            ▼                   ▼                    ▼
//!      [RTMP publisher]   [per-stream supervisor]  [HTTP surface]
//!      broadcast()        set_state()/pid          snapshot()
//! ```
//!
//! The map itself takes the reader-writer lock; everything per-record that
//! is touched on a hot path (state, counters) is atomic so readers never
//! contend with the media path.

pub mod key;
pub mod record;
pub mod relay;
pub mod store;

pub use key::StreamKey;
pub use record::{RecordSnapshot, StreamRecord, StreamState};
pub use relay::{FrameKind, RelayFrame};
pub use store::{RegistryConfig, StreamRegistry};
