//! Composable fragments of bootstrap scripts.

use std::fmt::Write as _;

/// The width of a banner line, not counting the leading newline.
const BANNER_WIDTH: usize = 80;

/// The prefix of every banner message.
const BANNER_PREFIX: &str = "[Gridwright Lite]";

/// The shell variable naming the work directory at run time.
pub(crate) const WORK_DIR_VARIABLE: &str = "gw_lite_work_dir";

/// The placeholder used for the work directory in transfer lists.
pub(crate) const WORK_DIR_TOKEN: &str = "${gw_lite_work_dir}";

/// The heredoc delimiter for inline transfer lists.
const HEREDOC_DELIMITER: &str = "EOF";

/// How a bootstrap script picks its work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkDir {
    /// The directory the scheduler starts the script in.
    SchedulerDirectory,
    /// A fresh directory created under a node-local parent directory.
    Under(String),
    /// A fresh directory under `GW_WN_TMP` if the node provides one.
    FromEnvironment,
}

/// A piece of a bootstrap script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Fragment {
    /// The shebang, version variables and library initialization.
    Preamble {
        /// The name of the shared library file to source.
        library: &'static str,
        /// Whether the worker package version must match exactly.
        strict_check: bool,
        /// Whether the script may download a worker package.
        allow_download: bool,
        /// The location of a worker package to download.
        package_url: Option<String>,
    },
    /// Traps tearing down the work directory exactly once.
    Traps,
    /// Sets up the work directory.
    WorkDir(WorkDir),
    /// Puts the worker package on the path.
    WorkerPackage,
    /// Fetches files through the data mover.
    Transfer {
        /// The banner message.
        message: &'static str,
        /// The data mover invocation.
        tool: String,
        /// The JSON transfer list.
        list: String,
    },
    /// Verifies the checksums of staged inputs.
    Integrity {
        /// The integrity tool invocation.
        tool: String,
        /// The logical names of the files to check.
        files: Vec<String>,
    },
    /// Sources an environment setup script.
    EnvironmentSetup(String),
    /// Runs the job, recording its exit code.
    Run(String),
    /// Clears the exit trap and exits with the job's code.
    Exit,
}

/// Escapes text for an unquoted heredoc, keeping the work directory token
/// expandable.
pub(crate) fn escape_heredoc(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(ch);
    }

    let escaped_token = format!("\\{WORK_DIR_TOKEN}");
    out.replace(&escaped_token, WORK_DIR_TOKEN)
}

/// Writes a banner message to the script's standard error.
fn banner(out: &mut String, message: &str) {
    let len = BANNER_PREFIX.len() + 1 + message.len();
    let pad = BANNER_WIDTH.saturating_sub(len) / 2;
    let hashes = "#".repeat(pad + 1);
    let _ = writeln!(
        out,
        "echo -e \"\\n{hashes}{BANNER_PREFIX} {message} {hashes}\"  1>&2"
    );
}

impl Fragment {
    /// Renders the fragment into a script.
    fn render(&self, out: &mut String) {
        // Writing to a string cannot fail.
        match self {
            Self::Preamble {
                library,
                strict_check,
                allow_download,
                package_url,
            } => {
                let _ = writeln!(out, "#!/bin/bash");
                let _ = writeln!(out, "# shellcheck disable=SC2034,SC2154");
                let _ = writeln!(out, "set -e");
                let _ = writeln!(
                    out,
                    "gw_lite_version_major=\"{}\"",
                    env!("CARGO_PKG_VERSION_MAJOR")
                );
                let _ = writeln!(
                    out,
                    "gw_lite_version_minor=\"{}\"",
                    env!("CARGO_PKG_VERSION_MINOR")
                );
                let _ = writeln!(
                    out,
                    "gw_lite_version_patch=\"{}\"",
                    env!("CARGO_PKG_VERSION_PATCH")
                );
                let _ = writeln!(out, "gw_lite_strict_worker_package_check=\"{strict_check}\"");
                let _ = writeln!(
                    out,
                    "gw_lite_allow_worker_package_download=\"{allow_download}\""
                );
                if let Some(url) = package_url {
                    let _ = writeln!(
                        out,
                        "export GW_WORKER_PACKAGE_URL={url}",
                        url = shlex::try_quote(url).unwrap_or_else(|_| url.into())
                    );
                }
                let _ = writeln!(out);
                let _ = writeln!(out, "# shellcheck source=/dev/null");
                let _ = writeln!(out, ". {library}");
                let _ = writeln!(out);
                let _ = writeln!(out, "gw_lite_init");
                let _ = writeln!(out);
            }
            Self::Traps => {
                let _ = writeln!(out, "# cleanup in case of failures");
                let _ = writeln!(out, "trap gw_lite_signal_int INT");
                let _ = writeln!(out, "trap gw_lite_signal_term TERM");
                let _ = writeln!(out, "trap gw_lite_unexpected_exit EXIT");
                let _ = writeln!(out);
            }
            Self::WorkDir(dir) => {
                banner(out, "Setting up workdir");
                match dir {
                    WorkDir::SchedulerDirectory => {
                        let _ = writeln!(out, "export {WORK_DIR_VARIABLE}=$PWD");
                    }
                    WorkDir::Under(parent) => {
                        let _ = writeln!(
                            out,
                            "export GW_WN_TMP={parent}",
                            parent = shlex::try_quote(parent).unwrap_or_else(|_| parent.into())
                        );
                    }
                    WorkDir::FromEnvironment => {}
                }
                let _ = writeln!(out, "gw_lite_setup_work_dir");
                let _ = writeln!(out);
            }
            Self::WorkerPackage => {
                banner(out, "Figuring out the worker package to use");
                let _ = writeln!(out, "gw_lite_worker_package");
                let _ = writeln!(out);
            }
            Self::Transfer {
                message,
                tool,
                list,
            } => {
                banner(out, message);
                let _ = writeln!(out, "{tool} 1>&2 << {HEREDOC_DELIMITER}");
                let list = escape_heredoc(list);
                let _ = writeln!(out, "{list}", list = list.trim_end());
                let _ = writeln!(out, "{HEREDOC_DELIMITER}");
                let _ = writeln!(out);
            }
            Self::Integrity { tool, files } => {
                banner(out, "Checking integrity of staged inputs");
                for file in files {
                    let _ = writeln!(
                        out,
                        "{tool} --verify={file} 1>&2",
                        file = shlex::try_quote(file).unwrap_or_else(|_| file.into())
                    );
                }
                let _ = writeln!(out);
            }
            Self::EnvironmentSetup(script) => {
                let script = shlex::try_quote(script).unwrap_or_else(|_| script.into());
                let _ = writeln!(out, "# shellcheck source=/dev/null");
                let _ = writeln!(out, ". {script}");
                let _ = writeln!(out);
            }
            Self::Run(command) => {
                banner(out, "Executing the user task");
                let _ = writeln!(out, "set +e");
                let _ = writeln!(out, "{command}");
                let _ = writeln!(out, "job_ec=$?");
                let _ = writeln!(out, "set -e");
                let _ = writeln!(out);
            }
            Self::Exit => {
                let _ = writeln!(out, "# clear the trap, and exit cleanly");
                let _ = writeln!(out, "trap - EXIT");
                let _ = writeln!(out, "gw_lite_final_exit");
            }
        }
    }
}

/// Assembles a bootstrap script from its fragments.
pub(crate) fn assemble(fragments: &[Fragment]) -> String {
    let mut out = String::new();
    for fragment in fragments {
        fragment.render(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn banners_are_centered() {
        let mut out = String::new();
        banner(&mut out, "Setting up workdir");
        let hashes = "#".repeat((80 - 36) / 2 + 1);
        assert_eq!(
            out,
            format!(
                "echo -e \"\\n{hashes}[Gridwright Lite] Setting up workdir {hashes}\"  1>&2\n"
            )
        );
    }

    #[test]
    fn heredoc_keeps_work_dir_expandable() {
        assert_eq!(
            escape_heredoc(r#"{"url": "file://${gw_lite_work_dir}/f.$a`b\c"}"#),
            r#"{"url": "file://${gw_lite_work_dir}/f.\$a\`b\\c"}"#
        );
    }

    #[test]
    fn run_records_exit_code() {
        let script = assemble(&[Fragment::Run("/bin/true".into()), Fragment::Exit]);
        assert!(script.contains("set +e\n/bin/true\njob_ec=$?\nset -e\n"));
        assert!(script.ends_with("trap - EXIT\ngw_lite_final_exit\n"));
    }
}
