pub mod cache;
pub mod comparator;
pub mod engine;
pub mod resume;
pub mod scanner;
pub mod throttle;
pub mod transfer;

pub use cache::DirectoryCache;
pub use comparator::{CompareMethod, FileComparator, SyncAction, SyncActionKind, SyncMode};
pub use engine::{SyncOptions, SyncResult, SyncSummary, Syncer};
pub use resume::{ResumeInfo, ResumeManager};
pub use scanner::{compute_local_checksum, compute_remote_checksum, FileScanner, PathFilter};
pub use throttle::{BandwidthLimiter, RateLimiter};
pub use transfer::{
    TransferDirection, TransferItem, TransferManager, TransferRequest, TransferStatus,
};
