mod fs_utils;
mod layout;
mod lock;
mod record;
mod store;

pub use fs_utils::{remove_file_if_exists, write_file_synced};
pub use layout::StateLayout;
pub use lock::{InstanceLock, LockOutcome};
pub use record::{format_timestamp, parse_record, parse_timestamp, serialize_record};
pub use store::StateStore;
