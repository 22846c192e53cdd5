//! Filesystem naming conventions and stale-state cleanup.
//!
//! Sockets and FIFOs live under `<tmpdir>/<prefix>_<user>/<pid>/<id>/`;
//! SHM objects are named `<prefix>_<user>-<pid>-<id>` for the copy arena
//! and `<prefix>_<user>-<pid>-<id>-<conn>-{s,r}` for ring buffers. The
//! user name is embedded so a global cleanup can tell its own leftovers
//! apart from another user's.

use std::path::PathBuf;

/// Prefix shared by every on-disk artifact of this plugin.
pub const SHM_PREFIX: &str = "nal_sm";
/// Directory POSIX SHM objects appear under on Linux.
#[cfg(target_os = "linux")]
pub const SHM_DIR: &str = "/dev/shm";

/// Pair-name suffix for the server-to-client direction.
pub const SEND_NAME: &str = "s";
/// Pair-name suffix for the client-to-server direction.
pub const RECV_NAME: &str = "r";

/// Best-effort login name, falling back to `USER` and then a constant so
/// path generation never fails.
pub fn username() -> String {
    if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::Uid::effective()) {
        return user.name;
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

fn tmp_dir() -> PathBuf {
    std::env::temp_dir()
}

/// `<tmpdir>/<prefix>_<user>` — the per-user root of socket directories.
pub fn user_dir(user: &str) -> PathBuf {
    tmp_dir().join(format!("{}_{}", SHM_PREFIX, user))
}

/// Directory holding one endpoint's socket (and FIFOs on non-eventfd
/// platforms).
pub fn endpoint_dir(user: &str, pid: i32, id: u32) -> PathBuf {
    user_dir(user).join(pid.to_string()).join(id.to_string())
}

/// Path of an endpoint's UNIX socket.
pub fn sock_path(user: &str, pid: i32, id: u32) -> PathBuf {
    endpoint_dir(user, pid, id).join("sock")
}

/// FIFO path for one direction of one connection.
#[cfg(not(target_os = "linux"))]
pub fn fifo_path(user: &str, pid: i32, id: u32, conn_id: u32, pair_name: &str) -> PathBuf {
    endpoint_dir(user, pid, id).join(format!("fifo-{}-{}", conn_id, pair_name))
}

/// SHM object name of an endpoint's copy arena.
pub fn copy_buf_name(user: &str, pid: i32, id: u32) -> String {
    format!("{}_{}-{}-{}", SHM_PREFIX, user, pid, id)
}

/// SHM object name of one ring-buffer direction of one connection.
pub fn ring_buf_name(user: &str, pid: i32, id: u32, conn_id: u32, pair_name: &str) -> String {
    format!(
        "{}_{}-{}-{}-{}-{}",
        SHM_PREFIX, user, pid, id, conn_id, pair_name
    )
}

/// Remove leftover sockets, FIFOs, directories, and SHM objects from
/// previous runs of the current user. Other users' artifacts are left
/// alone.
pub fn cleanup() {
    let user = username();

    // Files first, then directories, bottom up.
    let root = user_dir(&user);
    remove_tree(&root);

    // SHM objects: unlink every object carrying our prefix and user name.
    #[cfg(target_os = "linux")]
    {
        let prefix = format!("{}_{}-", SHM_PREFIX, user);
        if let Ok(entries) = std::fs::read_dir(SHM_DIR) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(&prefix) {
                    if let Err(e) = nix::sys::mman::shm_unlink(format!("/{}", name).as_str()) {
                        tracing::warn!(name, error = %e, "could not unlink shm object");
                    }
                }
            }
        }
    }
}

fn remove_tree(path: &std::path::Path) {
    let Ok(entries) = std::fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        let p = entry.path();
        if p.is_dir() {
            remove_tree(&p);
        } else if let Err(e) = std::fs::remove_file(&p) {
            tracing::warn!(path = %p.display(), error = %e, "could not remove file");
        }
    }
    let _ = std::fs::remove_dir(path);
}
