//! Wraps a job's command in a container runtime invocation.

use std::borrow::Cow;
use std::fmt::Write as _;

use crate::job::Container;
use crate::job::ContainerKind;

/// The directory the work directory is mounted at inside containers.
const GUEST_WORK_DIR: &str = "/srv";

/// Quotes a word for the shell.
fn quoted(word: &str) -> Cow<'_, str> {
    shlex::try_quote(word).unwrap_or(Cow::Borrowed(word))
}

/// Wraps a command so that it runs inside a container.
///
/// Without a container the command is returned as is.
pub(crate) fn wrap(container: Option<&Container>, command: &str) -> String {
    let Some(container) = container else {
        return command.to_string();
    };

    let mut out = String::new();
    let inner = quoted(command);

    // Writing to a string cannot fail.
    match container.kind {
        ContainerKind::Docker => {
            let tag = container.tag.as_deref().unwrap_or(&container.image);
            let _ = writeln!(
                out,
                "docker load -i {image} 1>&2",
                image = quoted(&container.image)
            );
            let _ = write!(
                out,
                "docker run --rm --user \"$(id -u):$(id -g)\" -v \"$PWD\":{GUEST_WORK_DIR} -w \
                 {GUEST_WORK_DIR}"
            );
            for mount in &container.mounts {
                let mount = quoted(mount);
                let _ = write!(out, " -v {mount}:{mount}");
            }
            let _ = write!(out, " {tag} /bin/bash -c {inner}", tag = quoted(tag));
        }
        ContainerKind::Singularity => {
            let _ = write!(
                out,
                "singularity exec --no-home --bind \"$PWD\":{GUEST_WORK_DIR} --pwd \
                 {GUEST_WORK_DIR}"
            );
            for mount in &container.mounts {
                let _ = write!(out, " --bind {mount}", mount = quoted(mount));
            }
            let _ = write!(
                out,
                " {image} /bin/bash -c {inner}",
                image = quoted(&container.image)
            );
        }
    }

    out
}
