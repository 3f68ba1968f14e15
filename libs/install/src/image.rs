use ibiop_operator::error::{Error, Result};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Seam to the external ISO assembly library. Given a populated
/// `cluster-configuration` directory it leaves `imagebasedconfig.iso` and the
/// `auth/` credential files in place.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, config_dir: &Path) -> Result<()>;
}

/// Production implementation shelling out to the installer binary.
pub struct InstallerImageBuilder {
    program: PathBuf,
}

impl InstallerImageBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ImageBuilder for InstallerImageBuilder {
    async fn build(&self, config_dir: &Path) -> Result<()> {
        debug!(
            msg = "invoking image builder",
            program = %self.program.display(),
            dir = %config_dir.display()
        );
        let output = Command::new(&self.program)
            .arg("create")
            .arg("--dir")
            .arg(config_dir)
            .output()
            .await
            .map_err(|e| {
                Error::IoError(
                    format!("failed to spawn image builder {}", self.program.display()),
                    e,
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ImageBuildError(format!(
                "image builder exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        info!(msg = "configuration image created", dir = %config_dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_successful_build() {
        let builder = InstallerImageBuilder::new("true");
        assert!(builder.build(Path::new("/tmp")).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_build_surfaces_status() {
        let builder = InstallerImageBuilder::new("false");
        let err = builder.build(Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, Error::ImageBuildError(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let builder = InstallerImageBuilder::new("/nonexistent/image-builder");
        let err = builder.build(Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, Error::IoError(_, _)));
    }
}
