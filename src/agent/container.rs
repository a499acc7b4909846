//! Container engine abstraction and host-side mount policy.
//!
//! The router never links a container runtime; it shells out to the
//! configured CLI (`docker`/`podman`) behind an object-safe trait so tests
//! can substitute a plain process.

use crate::config::ContainerConfig;
use crate::error::{Result, RouterError};
use crate::store::{MountSpec, Workspace};

use anyhow::Context as _;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// One resolved bind mount for an agent container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Everything needed to start one agent container.
#[derive(Debug, Clone)]
pub struct ContainerLaunch {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<ResolvedMount>,
}

/// Launch/terminate/kill surface of the container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Probe the engine. Startup treats a failure as fatal.
    async fn ensure_available(&self) -> Result<()>;

    /// Start a container with stdio piped to the returned child.
    async fn launch(&self, launch: &ContainerLaunch) -> Result<Child>;

    /// Graceful stop (SIGTERM inside the container).
    async fn terminate(&self, name: &str);

    /// Hard stop.
    async fn kill(&self, name: &str);
}

/// Engine that shells out to a docker-compatible CLI.
pub struct CliRuntime {
    engine: String,
}

impl CliRuntime {
    pub fn new(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn ensure_available(&self) -> Result<()> {
        let output = Command::new(&self.engine)
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| {
                RouterError::ContainerUnavailable(format!("{} not found: {error}", self.engine))
            })?;
        if !output.status.success() {
            return Err(RouterError::ContainerUnavailable(format!(
                "{} info failed: {}",
                self.engine,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn launch(&self, launch: &ContainerLaunch) -> Result<Child> {
        let mut cmd = Command::new(&self.engine);
        cmd.arg("run")
            .arg("-i")
            .arg("--rm")
            .arg("--name")
            .arg(&launch.name);

        for mount in &launch.mounts {
            let mut spec = format!("{}:{}", mount.host.display(), mount.container);
            if mount.read_only {
                spec.push_str(":ro");
            }
            cmd.arg("-v").arg(spec);
        }

        cmd.arg(&launch.image);
        for arg in &launch.command {
            cmd.arg(arg);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {} run", self.engine))?;
        Ok(child)
    }

    async fn terminate(&self, name: &str) {
        if let Err(error) = Command::new(&self.engine)
            .args(["kill", "--signal", "SIGTERM", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            tracing::debug!(%error, name, "container terminate failed");
        }
    }

    async fn kill(&self, name: &str) {
        if let Err(error) = Command::new(&self.engine)
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            tracing::debug!(%error, name, "container kill failed");
        }
    }
}

/// Unique per-run container name.
pub fn container_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "nanoclaw-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

/// Path fragments that must never be mounted into any container, whatever
/// the allow-list says.
const BLOCKED_COMPONENTS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".kube",
    "gcloud",
    "id_rsa",
    "id_ed25519",
    ".netrc",
];

/// Host-side mount policy: an allow-list of roots read from a host-only
/// file, plus the blocked-component deny list above.
#[derive(Debug, Clone, Default)]
pub struct MountPolicy {
    allowed_roots: Vec<PathBuf>,
}

impl MountPolicy {
    /// Read the allow-list file: one root per line, `#` comments. A missing
    /// file means no extra mounts are permitted.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::info!(
                    path = %path.display(),
                    %error,
                    "mount allow-list not readable, extra mounts disabled"
                );
                return Self::default();
            }
        };
        let allowed_roots = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(PathBuf::from)
            .collect();
        Self { allowed_roots }
    }

    #[cfg(test)]
    pub fn with_roots(allowed_roots: Vec<PathBuf>) -> Self {
        Self { allowed_roots }
    }

    fn is_allowed(&self, path: &Path) -> bool {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        if canonical.components().any(|component| {
            let text = component.as_os_str().to_string_lossy();
            BLOCKED_COMPONENTS
                .iter()
                .any(|blocked| text.eq_ignore_ascii_case(blocked))
        }) {
            return false;
        }

        self.allowed_roots
            .iter()
            .any(|root| canonical.starts_with(root))
    }

    /// Resolve the full mount set for a workspace run: the workspace folder
    /// read-write at the fixed workspace path, plus each approved extra
    /// mount under `extra/<name>`. Non-main workspaces get extras read-only
    /// regardless of what they asked for.
    pub fn resolve(
        &self,
        workspace: &Workspace,
        workspace_dir: &Path,
        container_config: &ContainerConfig,
        extra: &[MountSpec],
    ) -> Vec<ResolvedMount> {
        let workspace_mount = container_config.workspace_mount.trim_end_matches('/');
        let mut mounts = vec![ResolvedMount {
            host: workspace_dir.to_path_buf(),
            container: workspace_mount.to_string(),
            read_only: false,
        }];

        for spec in extra {
            if !self.is_allowed(&spec.host_path) {
                tracing::warn!(
                    folder = %workspace.folder,
                    host_path = %spec.host_path.display(),
                    "rejecting extra mount outside the allow-list"
                );
                continue;
            }
            let read_only = if workspace.is_main {
                spec.read_only
            } else {
                true
            };
            mounts.push(ResolvedMount {
                host: spec.host_path.clone(),
                container: format!("{workspace_mount}/extra/{}", spec.name),
                read_only,
            });
        }

        mounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(is_main: bool) -> Workspace {
        Workspace {
            chat_id: "g1".to_string(),
            name: "garden".to_string(),
            folder: "garden".to_string(),
            trigger_word: String::new(),
            requires_trigger: true,
            is_main,
            allowed_users: None,
            added_at: "2026-01-01T00:00:00.000Z".to_string(),
            container: None,
        }
    }

    fn mount(name: &str, path: &str, read_only: bool) -> MountSpec {
        MountSpec {
            name: name.to_string(),
            host_path: PathBuf::from(path),
            read_only,
        }
    }

    #[test]
    fn workspace_folder_is_always_mounted_read_write() {
        let policy = MountPolicy::default();
        let mounts = policy.resolve(
            &workspace(false),
            Path::new("/data/groups/garden"),
            &ContainerConfig::default(),
            &[],
        );
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].container, "/workspace");
        assert!(!mounts[0].read_only);
    }

    #[test]
    fn mounts_outside_allowed_roots_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let inside = tmp.path().join("shared");
        std::fs::create_dir_all(&inside).unwrap();

        let policy = MountPolicy::with_roots(vec![tmp.path().to_path_buf()]);
        let mounts = policy.resolve(
            &workspace(true),
            Path::new("/data/groups/main"),
            &ContainerConfig::default(),
            &[
                mount("ok", inside.to_str().unwrap(), false),
                mount("nope", "/etc", false),
            ],
        );
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].container, "/workspace/extra/ok");
    }

    #[test]
    fn blocked_components_beat_the_allow_list() {
        let tmp = tempfile::tempdir().unwrap();
        let sshdir = tmp.path().join(".ssh");
        std::fs::create_dir_all(&sshdir).unwrap();

        let policy = MountPolicy::with_roots(vec![tmp.path().to_path_buf()]);
        let mounts = policy.resolve(
            &workspace(true),
            Path::new("/data/groups/main"),
            &ContainerConfig::default(),
            &[mount("keys", sshdir.to_str().unwrap(), false)],
        );
        assert_eq!(mounts.len(), 1);
    }

    #[test]
    fn non_main_extra_mounts_are_forced_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = tmp.path().join("shared");
        std::fs::create_dir_all(&shared).unwrap();

        let policy = MountPolicy::with_roots(vec![tmp.path().to_path_buf()]);
        let mounts = policy.resolve(
            &workspace(false),
            Path::new("/data/groups/garden"),
            &ContainerConfig::default(),
            &[mount("shared", shared.to_str().unwrap(), false)],
        );
        assert!(mounts[1].read_only);

        let main_mounts = policy.resolve(
            &workspace(true),
            Path::new("/data/groups/main"),
            &ContainerConfig::default(),
            &[mount("shared", shared.to_str().unwrap(), false)],
        );
        assert!(!main_mounts[1].read_only);
    }

    #[test]
    fn container_names_are_unique_per_run() {
        let a = container_name();
        let b = container_name();
        assert!(a.starts_with("nanoclaw-"));
        assert_ne!(a, b);
    }
}
