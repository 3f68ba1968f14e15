use std::path::{Path, PathBuf};

use tokio::time::Duration;

/// Runtime configuration shared by both controllers.
///
/// Built once at startup from the process environment and threaded through
/// the controller contexts; nothing here is read from globals afterwards.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Service name used to synthesize the image base URL
    pub service_name: String,
    /// Namespace the serving service lives in
    pub service_namespace: String,
    /// URL scheme of the serving service
    pub service_scheme: String,
    /// Optional port of the serving service
    pub service_port: Option<u16>,
    /// Root directory for per-intent workspaces
    pub data_dir: PathBuf,
    /// Per-controller reconcile parallelism
    pub max_concurrent_reconciles: u16,
    /// Grace period after creating a DataImage before mutating the host
    pub data_image_cooldown: Duration,
}

impl ServiceConfig {
    /// Base URL of the file server that exposes generated ISO images.
    pub fn base_url(&self) -> String {
        let authority = format!("{}.{}", self.service_name, self.service_namespace);
        match self.service_port {
            Some(port) => format!("{}://{authority}:{port}", self.service_scheme),
            None => format!("{}://{authority}", self.service_scheme),
        }
    }

    /// URL under which the generated ISO for an intent is served.
    ///
    /// Keyed by UID rather than name so a delete/re-create of an intent
    /// cannot collide with a stale workspace on the file server.
    pub fn image_url(&self, namespace: &str, uid: &str) -> String {
        format!("{}/images/{namespace}/{uid}.iso", self.base_url())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(port: Option<u16>) -> ServiceConfig {
        ServiceConfig {
            service_name: "ibiop-images".to_string(),
            service_namespace: "ibiop-system".to_string(),
            service_scheme: "https".to_string(),
            service_port: port,
            data_dir: PathBuf::from("/data"),
            max_concurrent_reconciles: 1,
            data_image_cooldown: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_base_url_without_port() {
        assert_eq!(config(None).base_url(), "https://ibiop-images.ibiop-system");
    }

    #[test]
    fn test_base_url_with_port() {
        assert_eq!(
            config(Some(8443)).base_url(),
            "https://ibiop-images.ibiop-system:8443"
        );
    }

    #[test]
    fn test_image_url_is_uid_keyed() {
        let url = config(Some(8443)).image_url("cluster-ns", "8b9c2f60-1b2d-4df3-9f3e-0a4b1c2d3e4f");
        assert_eq!(
            url,
            "https://ibiop-images.ibiop-system:8443/images/cluster-ns/8b9c2f60-1b2d-4df3-9f3e-0a4b1c2d3e4f.iso"
        );
    }
}
