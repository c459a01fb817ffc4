//! Run pipeline: pull, assemble, isolate, clean up.

use std::path::Path;

use burrow_common::config::BurrowConfig;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{ImageReference, Termination};
use burrow_image::layer::unpacker_for;
use burrow_image::registry::{LayerBlob, RegistryClient};

use crate::isolate;
use crate::rootfs::RootFs;

/// One `run` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Image name, e.g. `busybox`.
    pub image: String,
    /// Absolute path of the command, identical on the host and in the root.
    pub command: String,
    /// Arguments passed to the command verbatim.
    pub args: Vec<String>,
}

/// Drives a single run from image name to exit status.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: BurrowConfig,
}

impl Engine {
    /// Creates an engine for `config`.
    #[must_use]
    pub const fn new(config: BurrowConfig) -> Self {
        Self { config }
    }

    /// Pulls the image, assembles a root, runs the command inside it, and
    /// removes the root.
    ///
    /// The root is removed on every path once it exists. When both the run
    /// and the removal fail, the run's error is returned and the removal
    /// error is logged.
    ///
    /// # Errors
    ///
    /// Returns the first pipeline error: [`BurrowError::Config`] for a bad
    /// image name or command, a registry error from the pull, a
    /// [`BurrowError::RootFs`] or [`BurrowError::Extraction`] while
    /// assembling, [`BurrowError::Isolation`] or [`BurrowError::Launch`]
    /// while running, or [`BurrowError::Cleanup`] if the root cannot be
    /// removed.
    pub fn run(&self, request: &RunRequest) -> Result<Termination> {
        let image = ImageReference::parse(&request.image, &self.config.default_namespace)?;
        if !Path::new(&request.command).is_absolute() {
            return Err(BurrowError::Config {
                message: format!(
                    "command must be an absolute path, got {}",
                    request.command
                ),
            });
        }
        tracing::info!(
            image = image.name(),
            repository = image.repository(),
            command = %request.command,
            "run requested"
        );

        // The client is dropped before the isolator forks.
        let layers = {
            let client = RegistryClient::new(&self.config)?;
            client.pull(&image)?.layers
        };

        let staging_dir = self.config.temp_parent();
        let root = RootFs::create(&staging_dir)?;

        let outcome = self
            .assemble(&root, request, layers, &staging_dir)
            .and_then(|()| isolate::run_isolated(root.path(), &request.command, &request.args));

        let cleanup = root.remove();
        match (outcome, cleanup) {
            (Ok(termination), Ok(())) => {
                tracing::info!(code = termination.exit_code(), "{termination}");
                Ok(termination)
            }
            (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(cleanup_err)) => {
                tracing::error!(error = %cleanup_err, "cleanup failed after run failure");
                Err(e)
            }
        }
    }

    fn assemble(
        &self,
        root: &RootFs,
        request: &RunRequest,
        layers: Vec<LayerBlob>,
        staging_dir: &Path,
    ) -> Result<()> {
        root.seed_dev_null()?;
        let _ = root.install_executable(Path::new(&request.command))?;
        let unpacker = unpacker_for(&self.config);
        root.apply_layers(layers, staging_dir, self.config.verify_digests, unpacker.as_ref())
    }
}
