//! Helpers for building a `lit` executable: installing the tracing and error
//! reporting machinery, locating the repository to operate on, and turning a
//! command's result into a process exit code. Argument parsing is left to the
//! caller.

#![warn(missing_docs)]
#![warn(
    clippy::all,
    clippy::as_conversions,
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro
)]
#![allow(clippy::too_many_arguments, clippy::blocks_in_conditions)]

use std::path::PathBuf;
use std::time::SystemTime;

use eyre::Context;
use lib::git::Repo;
use once_cell::sync::OnceCell;
use tracing::instrument;
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// The exit code a command reports when it finished without an error but did
/// not succeed, such as a merge stopping on conflicts.
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExitCode(pub isize);

impl ExitCode {
    /// The exit code for a successful command.
    pub fn success() -> Self {
        Self(0)
    }

    /// Whether this exit code indicates success.
    pub fn is_success(&self) -> bool {
        match self {
            ExitCode(0) => true,
            ExitCode(_) => false,
        }
    }
}

/// Result of a command: an error, an unsuccessful exit code, or a value.
pub type EyreExitOr<T> = eyre::Result<Result<T, ExitCode>>;

/// Shared context for all commands.
#[derive(Clone, Debug)]
pub struct CommandContext {
    /// The directory the command was invoked from.
    pub working_directory: PathBuf,

    /// The time at which the command was invoked. New commits are stamped
    /// with this time.
    pub now: SystemTime,
}

impl CommandContext {
    /// Constructor.
    pub fn new(working_directory: PathBuf) -> Self {
        CommandContext {
            working_directory,
            now: SystemTime::now(),
        }
    }

    /// Open the repository containing the working directory.
    #[instrument]
    pub fn get_repo(&self) -> eyre::Result<Repo> {
        Repo::discover(&self.working_directory).wrap_err_with(|| {
            format!(
                "Could not open repository from: {:?}",
                &self.working_directory
            )
        })
    }
}

static TRACING_INSTALLED: OnceCell<()> = OnceCell::new();

/// Install the global tracing subscriber and the `color-eyre` report hooks.
/// Log output goes to stderr and is filtered by `RUST_LOG`, defaulting to
/// warnings from `lit` itself. Calling this more than once has no further
/// effect.
#[instrument]
pub fn install_tracing() -> eyre::Result<()> {
    TRACING_INSTALLED.get_or_try_init(|| -> eyre::Result<()> {
        color_eyre::install()?;

        let env_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .parse(
                std::env::var(EnvFilter::DEFAULT_ENV)
                    .unwrap_or_else(|_| "lit=warn,lit_invoke=warn".to_string()),
            )?;
        let fmt_layer = tracing_fmt::layer().with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(ErrorLayer::default())
            .with(fmt_layer.with_filter(env_filter))
            .try_init()?;
        Ok(())
    })?;
    Ok(())
}

/// Wrapper function for `main` to ensure that `Drop` is called for local
/// variables, since `std::process::exit` will skip them. You probably want to
/// call `invoke_main` instead.
///
/// The command runs from `working_directory`, or from the current directory
/// if not provided.
#[instrument(skip(f))]
pub fn do_main_and_drop_locals(
    f: impl Fn(CommandContext) -> EyreExitOr<()>,
    working_directory: Option<PathBuf>,
) -> eyre::Result<i32> {
    install_tracing()?;

    let working_directory = match working_directory {
        Some(working_directory) => working_directory,
        None => std::env::current_dir().wrap_err("Could not determine the current directory")?,
    };
    let ctx = CommandContext::new(working_directory);
    let exit_code = match f(ctx)? {
        Ok(()) => 0,
        Err(ExitCode(exit_code)) => {
            let exit_code: i32 = exit_code.try_into()?;
            exit_code
        }
    };
    Ok(exit_code)
}

/// Run the provided command from the current directory and exit the process
/// with its exit code. Errors are reported to stderr and exit with code 1.
///
/// ```ignore
/// fn main() {
///     lit_invoke::invoke_main(my_command_main)
/// }
/// ```
pub fn invoke_main(f: impl Fn(CommandContext) -> EyreExitOr<()>) {
    let exit_code = match do_main_and_drop_locals(f, None) {
        Ok(exit_code) => exit_code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            1
        }
    };
    std::process::exit(exit_code);
}
