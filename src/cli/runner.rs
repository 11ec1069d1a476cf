//! Runner for the fetch-and-squash command

use crate::cli::args::Args;
use crate::error::{FetchError, Result};
use crate::fetch::{Client, release_layers};
use crate::logging::{EventObserver, Logger};
use crate::squash::Squasher;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const ROOTFS_FILE_NAME: &str = "rootfs.tgz";
const LAYER_DIR_PREFIX: &str = "rootfs_layers_";
const PARTIAL_PREFIX: &str = ".rootfs_partial_";

pub struct Runner {
    args: Args,
    logger: Arc<Logger>,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        let logger = if args.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.verbose)
        };
        Self {
            args,
            logger: Arc::new(logger),
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub async fn run(&self) -> Result<()> {
        self.logger.section("rootfs fetch");
        let config = self.args.to_config()?;
        let output = default_output_path()?;

        let client = Client::new(config)?.with_observer(self.logger.clone());
        // Layer files live here until released; anything left behind by a
        // failed fetch goes with the directory.
        let scratch = tempfile::Builder::new()
            .prefix(LAYER_DIR_PREFIX)
            .tempdir()
            .map_err(|e| FetchError::Io {
                message: format!("could not create layer directory: {}", e),
                path: None,
            })?;

        self.logger.info(&format!("Fetching {}", self.args.image));
        let layers = tokio::select! {
            result = client.fetch(scratch.path(), &self.args.image) => result?,
            _ = tokio::signal::ctrl_c() => return Err(FetchError::Cancelled),
        };
        self.logger
            .info(&format!("Fetched {} layers, squashing", layers.len()));

        let observer: Arc<dyn EventObserver> = self.logger.clone();
        let target = output.clone();
        let (layers, squashed) = tokio::task::spawn_blocking(move || {
            let mut layers = layers;
            let result = write_rootfs(&mut layers, &target, observer);
            (layers, result)
        })
        .await
        .map_err(|e| FetchError::Io {
            message: format!("squash task failed: {}", e),
            path: None,
        })?;

        let released = release_layers(layers);
        squashed?;
        released?;

        self.logger.success(&format!(
            "Wrote {} in {}",
            output.display(),
            self.logger.format_duration(self.logger.elapsed())
        ));
        Ok(())
    }
}

fn default_output_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        FetchError::Configuration("could not determine the home directory".to_string())
    })?;
    Ok(home.join(ROOTFS_FILE_NAME))
}

/// Squash into a temporary file next to `path` and move it into place on
/// success. A failed run leaves any earlier `path` untouched.
fn write_rootfs<R: Read>(
    layers: &mut [R],
    path: &Path,
    observer: Arc<dyn EventObserver>,
) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let partial = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| FetchError::io_at(e, dir))?;

    let mut sink = BufWriter::new(partial);
    Squasher::new(observer).squash_layers(layers, &mut sink)?;
    let partial = sink
        .into_inner()
        .map_err(|e| FetchError::io_at(e.into_error(), path))?;
    partial
        .persist(path)
        .map_err(|e| FetchError::io_at(e.error, path))?;
    Ok(())
}
