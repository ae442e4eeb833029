//! Embedded runtime seam
//!
//! The inner stage hands modules and runtime options to an
//! [`EmbeddedRuntime`]. [`NativeEntryRuntime`] is the stock implementation:
//! it runs the bundle's extracted entry executable.

use std::ffi::OsString;
use std::io::{Read, Seek};
use std::process::Command;

use thaw_archive::{Archive, EntryKind, ModuleArchive};

use crate::error::{BootError, Result};
use crate::extract::entry_path;
use crate::launch::{signals, RuntimeContext};

/// Prefix of runtime options that set an environment variable.
const ENV_OPTION_PREFIX: &str = "env:";

/// Options stored as runtime-option entries of the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// `env:KEY=VALUE` options, in archive order
    pub env: Vec<(String, String)>,
    /// Every other option, in archive order
    pub args: Vec<String>,
}

impl RuntimeOptions {
    pub fn parse<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Self::default();
        for option in options {
            let option = option.as_ref();
            match option.strip_prefix(ENV_OPTION_PREFIX) {
                Some(assignment) => match assignment.split_once('=') {
                    Some((key, value)) if !key.is_empty() => {
                        parsed.env.push((key.to_string(), value.to_string()))
                    }
                    _ => tracing::warn!(option, "ignoring malformed environment option"),
                },
                None => parsed.args.push(option.to_string()),
            }
        }
        parsed
    }

    pub fn from_archive<R: Read + Seek>(archive: &Archive<R>) -> Self {
        Self::parse(archive.entries_of(EntryKind::RuntimeOption).map(|entry| entry.name.as_str()))
    }
}

/// Runs the application once the bootstrap has prepared everything.
pub trait EmbeddedRuntime {
    /// Run the application and return its exit code.
    fn run(
        &self,
        ctx: &RuntimeContext,
        modules: &ModuleArchive,
        options: &RuntimeOptions,
    ) -> Result<i32>;
}

/// Executes the extracted file named by the manifest's `entry`.
///
/// Runtime options other than `env:` assignments become leading arguments,
/// followed by the arguments the bundle was launched with.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeEntryRuntime;

impl EmbeddedRuntime for NativeEntryRuntime {
    fn run(
        &self,
        ctx: &RuntimeContext,
        modules: &ModuleArchive,
        options: &RuntimeOptions,
    ) -> Result<i32> {
        let entry = ctx
            .manifest
            .bundle
            .entry
            .as_deref()
            .ok_or_else(|| BootError::launch("bundle manifest declares no entry"))?;
        let program = entry_path(&ctx.cache_dir, entry);
        tracing::debug!(
            program = %program.display(),
            modules = modules.len(),
            options = options.args.len() + options.env.len(),
            "starting entry"
        );

        let mut command = Command::new(&program);
        command.args(&options.args);
        command.args(ctx.args.iter().skip(1));
        ctx.child_env.apply(&mut command);
        command.envs(options.env.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))));

        let mut child = command
            .spawn()
            .map_err(|e| BootError::launch_io(format!("cannot start {}", program.display()), e))?;
        let _forwarding = signals::forward_to(child.id());
        let status = child
            .wait()
            .map_err(|e| BootError::launch_io(format!("waiting for {}", program.display()), e))?;
        Ok(signals::exit_code(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let options = RuntimeOptions::parse([
            "-v",
            "env:LANG=C.UTF-8",
            "env:EMPTY=",
            "env:=bad",
            "env:nokey",
            "--fast",
        ]);
        assert_eq!(options.args, vec!["-v", "--fast"]);
        assert_eq!(
            options.env,
            vec![
                ("LANG".to_string(), "C.UTF-8".to_string()),
                ("EMPTY".to_string(), String::new())
            ]
        );
    }
}
