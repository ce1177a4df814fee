//! Durable storage: the per-stream operation log, keyframes, sync cursors and
//! remotes, all sharing one SQLite pool.

pub mod cursor_store;
pub mod database;
pub mod errors;
pub mod keyframe_store;
pub mod migrations;
pub mod operation_store;
pub mod remote_store;
pub mod types;

pub use cursor_store::{CursorStore, CursorType, SqlCursorStore, SyncCursor};
pub use database::{check_aborted, AbortSignal, Database};
pub use errors::{StoreError, StoreResult};
pub use keyframe_store::{Keyframe, KeyframeStore, SqlKeyframeStore};
pub use operation_store::{read_stream, write_all, AtomicTxn, OperationStore, SqlOperationStore, TxnWriter};
pub use remote_store::{RemoteStore, SqlRemoteStore};
pub use types::*;
