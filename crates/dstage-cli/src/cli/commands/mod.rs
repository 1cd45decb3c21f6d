//! CLI command handlers, one file per command.

mod check_uploads;
mod checksum;
mod recovery;
mod stage;

pub use check_uploads::run_check_uploads;
pub use checksum::run_checksum;
pub use recovery::run_recovery;
pub use stage::{run_stage, StageRequest};

use dstage_core::job::LocalUser;
use std::path::Path;

/// Local account for a session directory: explicit ids, else the directory's owner.
pub(crate) fn session_user(session_dir: &Path, uid: Option<u32>, gid: Option<u32>) -> LocalUser {
    use std::os::unix::fs::MetadataExt;

    let owner = std::fs::metadata(session_dir).ok();
    let uid = uid.or_else(|| owner.as_ref().map(|m| m.uid())).unwrap_or(0);
    let gid = gid.or_else(|| owner.as_ref().map(|m| m.gid())).unwrap_or(0);
    let name = std::env::var("USER").unwrap_or_default();
    LocalUser::new(uid, gid, name)
}
