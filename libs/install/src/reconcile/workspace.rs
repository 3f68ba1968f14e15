use ibiop_operator::error::{Error, Result};

use std::future::Future;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

pub const ISO_FILE_NAME: &str = "imagebasedconfig.iso";
pub const LOCK_FILE_NAME: &str = "lock";

/// Filesystem layout of a per-intent workspace:
///
/// ```text
/// <root>/namespaces/<namespace>/<uid>/
///   lock
///   files/cluster-configuration/
///     image-based-config.yaml
///     install-config.yaml
///     extra-manifests/*.yaml
///     auth/{kubeconfig,kubeadmin-password}
///     imagebasedconfig.iso
/// ```
#[derive(Clone, Debug)]
pub struct IntentWorkspace {
    dir: PathBuf,
}

impl IntentWorkspace {
    pub fn new(root: &Path, namespace: &str, uid: &str) -> Self {
        Self {
            dir: root.join("namespaces").join(namespace).join(uid),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.exists()
    }

    pub fn files_dir(&self) -> PathBuf {
        self.dir.join("files")
    }

    pub fn cluster_config_dir(&self) -> PathBuf {
        self.files_dir().join("cluster-configuration")
    }

    pub fn extra_manifests_dir(&self) -> PathBuf {
        self.cluster_config_dir().join("extra-manifests")
    }

    pub fn auth_dir(&self) -> PathBuf {
        self.cluster_config_dir().join("auth")
    }

    pub fn install_config_path(&self) -> PathBuf {
        self.cluster_config_dir().join("install-config.yaml")
    }

    pub fn image_based_config_path(&self) -> PathBuf {
        self.cluster_config_dir().join("image-based-config.yaml")
    }

    pub fn iso_path(&self) -> PathBuf {
        self.cluster_config_dir().join(ISO_FILE_NAME)
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.auth_dir().join("kubeconfig")
    }

    pub fn kubeadmin_password_path(&self) -> PathBuf {
        self.auth_dir().join("kubeadmin-password")
    }

    /// The ISO and both credential files survived a previous pass; the
    /// expensive generation step can be skipped.
    pub fn artifacts_present(&self) -> bool {
        self.iso_path().exists()
            && self.kubeconfig_path().exists()
            && self.kubeadmin_password_path().exists()
    }
}

/// Result of a try-lock attempt: contention is not an error, it is a signal
/// to requeue shortly and try again.
#[derive(Debug)]
pub enum LockOutcome<T> {
    Acquired(T),
    Contended,
}

fn open_lock_file(dir: &Path) -> Result<std::fs::File> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::IoError(format!("failed to create {}", dir.display()), e))?;
    let lock_path = dir.join(LOCK_FILE_NAME);
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| Error::IoError(format!("failed to open {}", lock_path.display()), e))
}

fn is_contended(e: &std::io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Run `critical` while holding the workspace write lock.
///
/// Distinguishes three outcomes: the lock could not be acquired
/// (`Ok(Contended)`, retry later), acquiring failed or the critical section
/// failed (`Err`), and success (`Ok(Acquired)`).
pub async fn with_write_lock<T, Fut>(dir: &Path, critical: Fut) -> Result<LockOutcome<T>>
where
    Fut: Future<Output = Result<T>>,
{
    let file = open_lock_file(dir)?;
    match fs2::FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            debug!(msg = "workspace write lock acquired", dir = %dir.display());
            let result = critical.await;
            let _ = fs2::FileExt::unlock(&file);
            result.map(LockOutcome::Acquired)
        }
        Err(e) if is_contended(&e) => Ok(LockOutcome::Contended),
        Err(e) => Err(Error::IoError(
            format!("failed to lock {}", dir.display()),
            e,
        )),
    }
}

/// Shared-mode counterpart used by ISO readers; writers are excluded while
/// any reader holds the lock.
pub async fn with_read_lock<T, Fut>(dir: &Path, critical: Fut) -> Result<LockOutcome<T>>
where
    Fut: Future<Output = Result<T>>,
{
    let file = open_lock_file(dir)?;
    match fs2::FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let result = critical.await;
            let _ = fs2::FileExt::unlock(&file);
            result.map(LockOutcome::Acquired)
        }
        Err(e) if is_contended(&e) => Ok(LockOutcome::Contended),
        Err(e) => Err(Error::IoError(
            format!("failed to lock {}", dir.display()),
            e,
        )),
    }
}

/// Remove the whole workspace under the write lock.
pub async fn remove_workspace(workspace: &IntentWorkspace) -> Result<LockOutcome<()>> {
    if !workspace.exists() {
        return Ok(LockOutcome::Acquired(()));
    }
    let dir = workspace.dir().to_path_buf();
    with_write_lock(workspace.dir(), async move {
        info!(msg = "removing workspace", dir = %dir.display());
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| Error::IoError(format!("failed to remove {}", dir.display()), e))
    })
    .await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_workspace_layout() {
        let workspace = IntentWorkspace::new(Path::new("/data"), "ns", "uid-1234");
        assert_eq!(
            workspace.dir(),
            Path::new("/data/namespaces/ns/uid-1234")
        );
        assert_eq!(
            workspace.iso_path(),
            Path::new("/data/namespaces/ns/uid-1234/files/cluster-configuration/imagebasedconfig.iso")
        );
        assert_eq!(
            workspace.kubeconfig_path(),
            Path::new("/data/namespaces/ns/uid-1234/files/cluster-configuration/auth/kubeconfig")
        );
        assert_eq!(
            workspace.extra_manifests_dir(),
            Path::new("/data/namespaces/ns/uid-1234/files/cluster-configuration/extra-manifests")
        );
    }

    #[tokio::test]
    async fn test_write_lock_runs_critical_section() {
        let root = tempfile::tempdir().unwrap();
        let outcome = with_write_lock(root.path(), async { Ok(42) }).await.unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(42)));
    }

    #[tokio::test]
    async fn test_write_lock_reports_contention() {
        let root = tempfile::tempdir().unwrap();
        let held = open_lock_file(root.path()).unwrap();
        fs2::FileExt::lock_exclusive(&held).unwrap();

        let outcome = with_write_lock(root.path(), async { Ok(()) }).await.unwrap();
        assert!(matches!(outcome, LockOutcome::Contended));

        fs2::FileExt::unlock(&held).unwrap();
        let outcome = with_write_lock(root.path(), async { Ok(()) }).await.unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(())));
    }

    #[tokio::test]
    async fn test_readers_share_writers_wait() {
        let root = tempfile::tempdir().unwrap();
        let reader = open_lock_file(root.path()).unwrap();
        fs2::FileExt::lock_shared(&reader).unwrap();

        let shared = with_read_lock(root.path(), async { Ok(()) }).await.unwrap();
        assert!(matches!(shared, LockOutcome::Acquired(())));

        let exclusive = with_write_lock(root.path(), async { Ok(()) }).await.unwrap();
        assert!(matches!(exclusive, LockOutcome::Contended));
    }

    #[tokio::test]
    async fn test_critical_section_error_is_distinguished() {
        let root = tempfile::tempdir().unwrap();
        let result: Result<LockOutcome<()>> = with_write_lock(root.path(), async {
            Err(Error::MissingData("boom".to_string()))
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_remove_workspace() {
        let root = tempfile::tempdir().unwrap();
        let workspace = IntentWorkspace::new(root.path(), "ns", "uid");
        tokio::fs::create_dir_all(workspace.auth_dir()).await.unwrap();
        tokio::fs::write(workspace.kubeconfig_path(), b"kc").await.unwrap();
        assert!(workspace.exists());

        let outcome = remove_workspace(&workspace).await.unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(())));
        assert!(!workspace.exists());

        // removing an absent workspace is a no-op
        let outcome = remove_workspace(&workspace).await.unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(())));
    }
}
