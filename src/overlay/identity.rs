use fuser::Request;
use std::io;
use std::path::Path;

/// Hand a newly created entry to the requesting user.
///
/// The daemon creates entries with its own credentials; when it runs as root
/// that would leave them owned by root, so ownership is forwarded from the
/// request. Unprivileged daemons cannot chown and keep their own identity.
pub(crate) fn forward_identity(req: &Request<'_>, path: &Path) -> io::Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Ok(());
    }
    std::os::unix::fs::lchown(path, Some(req.uid()), Some(req.gid()))
}
