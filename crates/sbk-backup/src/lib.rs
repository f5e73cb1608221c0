//! sbk-backup: the encrypted backup container
//!
//! - [`writer`] / [`reader`]: the frame codec over a counter-IV cipher session
//! - [`frame`]: the closed frame union; [`proto`] holds its wire messages
//! - [`export`]: walks the local stores and emits frames in a fixed order
//! - [`import`]: replays frames transactionally into the local stores
//! - [`inspect`]: read-only census of a backup
//! - [`events`]: fire-and-forget progress channel
//!
//! Stream layout:
//! ```text
//! [len][Header{iv, salt}]                     cleartext
//! [len][AES-CTR(frame)][HMAC[..10]]           one per frame
//! [AES-CTR(payload)][HMAC(iv ‖ ct)[..10]]     after attachment/sticker/avatar frames
//! ```

pub mod events;
pub mod export;
pub mod frame;
pub mod import;
pub mod inspect;
pub mod proto;
pub mod reader;
pub mod writer;

pub use events::EventBus;
pub use export::Exporter;
pub use frame::BackupFrame;
pub use import::{ImportSummary, Importer};
pub use inspect::{inspect, InspectReport};
pub use reader::{FrameReader, DEFAULT_MAX_FRAME_LENGTH};
pub use writer::FrameWriter;

pub use tokio_util::sync::CancellationToken;
