pub mod atomic;
pub mod error;
pub mod fs;
pub mod normalize;
pub mod output;
pub mod scheduler;
pub mod schema;
pub mod source;
pub mod store;
pub mod timer;
pub mod writer;

pub use atomic::{RetryPolicy, WriteFailure};
pub use error::SyncError;
pub use fs::{DurableFileSystem, LocalFileSystem, MemoryFileSystem};
pub use normalize::{NormalizeOptions, normalize_tasks};
pub use output::{OutputPathResolver, PathTransition, meta_path_for, resolve_output_path};
pub use scheduler::{FlushOutcome, IndexSync, SyncStats};
pub use schema::{AiIndexMeta, NormalizedTask, SCHEMA_VERSION, Task, TaskStatus};
pub use source::{LogNotifier, MemoryTaskSource, Notifier, TaskSource};
pub use store::{IndexSnapshot, IndexStore, PathUpdate};
pub use writer::DurableSnapshotWriter;
