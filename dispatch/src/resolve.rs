use std::{fs, path::PathBuf};

/// Host service resolving a guest file descriptor to the path it was opened
/// from, for `REGISTER_FILE` log records.
pub trait FdResolver {
    fn resolve(&self, fd: i32) -> Option<PathBuf>;
}

/// Resolves descriptors through the `/proc/self/fd` symlinks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcSelfFd;

impl FdResolver for ProcSelfFd {
    fn resolve(&self, fd: i32) -> Option<PathBuf> {
        if fd < 0 {
            return None;
        }
        fs::read_link(format!("/proc/self/fd/{fd}")).ok()
    }
}
