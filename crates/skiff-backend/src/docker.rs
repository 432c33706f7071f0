//! Container-engine client: image/container listing, pull, build, search and
//! the container half of the resource backend, all over the engine's HTTP API.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, CreateImageOptions, ListImagesOptions, SearchImagesOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, instrument, warn};

use skiff_common::{
    ProvisionOutcome, ResourceBackend, ResourceKind, ResourceSpec, Result, SkiffError,
};

/// How many trailing build-log lines are kept for a `BuildFailed` error.
const BUILD_LOG_TAIL: usize = 20;

/// Grace period the engine gives a container before killing it on stop.
const STOP_GRACE_SECS: i64 = 10;

/// Map an engine error into the shared taxonomy. HTTP status codes carry the
/// useful distinctions; everything else means we could not talk to the daemon.
fn classify(context: &str, err: BollardError) -> SkiffError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => SkiffError::NotFound(format!("{context}: {message}")),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => SkiffError::ResourceConflict(format!("{context}: {message}")),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => SkiffError::Internal(format!("{context}: engine returned {status_code}: {message}")),
        other => SkiffError::BackendUnavailable(format!("{context}: {other}")),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageRow {
    pub id: String,
    pub tags: Vec<String>,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerRow {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchRow {
    pub name: String,
    pub star_count: i64,
    pub description: String,
}

/// Substring search over locally available image tags.
pub fn search_local(tags: &[String], term: &str) -> Vec<String> {
    tags.iter().filter(|t| t.contains(term)).cloned().collect()
}

/// Create `folder` if needed and write its `Dockerfile` with the given
/// instructions, one per line.
pub fn write_dockerfile(folder: &Path, lines: &[String]) -> Result<PathBuf> {
    std::fs::create_dir_all(folder)?;
    let path = folder.join("Dockerfile");
    let mut contents = lines.join("\n");
    contents.push('\n');
    std::fs::write(&path, contents)?;
    info!(path = %path.display(), "Dockerfile written");
    Ok(path)
}

fn tar_context(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", path)?;
    builder.into_inner()
}

/// Client for the container engine. Explicitly constructed and passed around;
/// health is checked on demand, never assumed from a connect-at-import.
#[derive(Clone)]
pub struct DockerBackend {
    client: Arc<Docker>,
}

impl DockerBackend {
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| SkiffError::BackendUnavailable(format!("docker connect: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn client(&self) -> Arc<Docker> {
        self.client.clone()
    }

    /// Ping the daemon. Cheap enough to call before anything that would
    /// otherwise fail with a confusing transport error.
    pub async fn health_check(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| classify("ping daemon", e))
    }

    fn container_name(id: &str) -> String {
        format!("skiff-{id}")
    }

    pub async fn list_images(&self) -> Result<Vec<ImageRow>> {
        let images = self
            .client
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| classify("list images", e))?;

        Ok(images
            .into_iter()
            .map(|img| ImageRow {
                id: img.id,
                tags: img.repo_tags,
                size_bytes: img.size,
            })
            .collect())
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerRow>> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| classify("list containers", e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerRow {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                status: c.status.or(c.state).unwrap_or_default(),
                image: c.image.unwrap_or_default(),
            })
            .collect())
    }

    /// Pull an image from the registry, reporting progress line-by-line.
    #[instrument(skip(self, progress))]
    pub async fn pull<F>(&self, image: &str, mut progress: F) -> Result<()>
    where
        F: FnMut(&str) + Send,
    {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        while let Some(item) = stream.next().await {
            let update = item.map_err(|e| classify("pull image", e))?;
            if let Some(err) = update.error {
                return Err(SkiffError::Internal(format!("pull '{image}': {err}")));
            }
            if let Some(status) = update.status {
                let line = match (update.id, update.progress) {
                    (Some(id), Some(p)) => format!("{id}: {status} {p}"),
                    (Some(id), None) => format!("{id}: {status}"),
                    (None, _) => status,
                };
                progress(&line);
            }
        }
        info!(image, "image pulled");
        Ok(())
    }

    /// Build an image from a directory containing a Dockerfile, streaming log
    /// lines to `on_log`. On failure the last lines of the log are captured in
    /// the error.
    #[instrument(skip(self, on_log), fields(context = %context_path.display()))]
    pub async fn build<F>(&self, context_path: &Path, tag: &str, mut on_log: F) -> Result<()>
    where
        F: FnMut(&str) + Send,
    {
        if !context_path.is_dir() {
            return Err(SkiffError::NotFound(format!(
                "build context '{}'",
                context_path.display()
            )));
        }
        if !context_path.join("Dockerfile").is_file() {
            return Err(SkiffError::NotFound(format!(
                "no Dockerfile in '{}'",
                context_path.display()
            )));
        }

        let tarball = tar_context(context_path)?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut tail: VecDeque<String> = VecDeque::new();
        let mut stream = self
            .client
            .build_image(options, None, Some(tarball.into()));

        while let Some(item) = stream.next().await {
            match item {
                Ok(update) => {
                    if let Some(line) = update.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            if tail.len() == BUILD_LOG_TAIL {
                                tail.pop_front();
                            }
                            tail.push_back(line.to_string());
                            on_log(line);
                        }
                    }
                    if let Some(err) = update.error {
                        return Err(SkiffError::BuildFailed {
                            message: err,
                            log_tail: tail.into_iter().collect(),
                        });
                    }
                }
                Err(e) => {
                    return match classify("build image", e) {
                        SkiffError::BackendUnavailable(msg) => {
                            Err(SkiffError::BackendUnavailable(msg))
                        }
                        other => Err(SkiffError::BuildFailed {
                            message: other.to_string(),
                            log_tail: tail.into_iter().collect(),
                        }),
                    };
                }
            }
        }
        info!(tag, "image built");
        Ok(())
    }

    /// Stop a container by engine id or name (engine-level operation, distinct
    /// from stopping an orchestrated resource).
    pub async fn stop_container(&self, name_or_id: &str) -> Result<()> {
        self.client
            .stop_container(name_or_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(|e| classify("stop container", e))
    }

    /// Search Docker Hub.
    pub async fn search(&self, term: &str) -> Result<Vec<SearchRow>> {
        let results = self
            .client
            .search_images(SearchImagesOptions {
                term: term.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| classify("search images", e))?;

        Ok(results
            .into_iter()
            .map(|r| SearchRow {
                name: r.name.unwrap_or_default(),
                star_count: r.star_count.unwrap_or(0),
                description: r.description.unwrap_or_default(),
            })
            .collect())
    }
}

#[async_trait]
impl ResourceBackend for DockerBackend {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Container
    }

    #[instrument(skip(self, spec), fields(id = %id))]
    async fn provision(&self, id: &str, spec: &ResourceSpec) -> Result<ProvisionOutcome> {
        let spec = match spec {
            ResourceSpec::Container(c) => c,
            other => {
                return Err(SkiffError::InvalidSpec(format!(
                    "container backend cannot provision a {}",
                    other.kind()
                )))
            }
        };

        let name = Self::container_name(id);
        let host_config = HostConfig {
            memory: spec.memory_mb.map(|m| i64::from(m) * 1024 * 1024),
            cpu_count: spec.cpu_count.map(i64::from),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: spec.env.clone(),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| classify("create container", e))?;
        info!(container_id = %created.id, %name, "container created");

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify("start container", e))?;
        info!(container_id = %created.id, "container started");

        // Watch for the container dying underneath the registry.
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        let container_id = created.id.clone();
        tokio::spawn(async move {
            let mut wait_stream = client.wait_container(
                &container_id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            let notice = match wait_stream.next().await {
                Some(Ok(body)) if body.status_code == 0 => None,
                Some(Ok(body)) => Some(format!(
                    "container exited with status {}",
                    body.status_code
                )),
                Some(Err(e)) => Some(format!("container wait failed: {e}")),
                None => Some("container wait stream ended unexpectedly".to_string()),
            };
            let _ = tx.send(notice);
        });

        Ok(ProvisionOutcome {
            backend_ref: created.id,
            exited: Some(rx),
        })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.stop_container(&Self::container_name(id)).await
    }

    async fn probe(&self, id: &str) -> Result<bool> {
        let name = Self::container_name(id);
        match self
            .client
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(details
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(classify("inspect container", e)),
        }
    }

    async fn reap(&self, id: &str) {
        let name = Self::container_name(id);
        let opts = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        match self.client.remove_container(&name, opts).await {
            Ok(()) => info!(%name, "container removed"),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => warn!(%name, error = %e, "failed to remove container during reap"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_search_filters_by_substring() {
        let tags = vec!["nginx:latest".to_string(), "mongo:5".to_string()];
        assert_eq!(search_local(&tags, "ngin"), vec!["nginx:latest".to_string()]);
        assert!(search_local(&tags, "redis").is_empty());
    }

    #[test]
    fn container_names_derive_from_resource_id() {
        assert_eq!(DockerBackend::container_name("abc-123"), "skiff-abc-123");
    }

    #[test]
    fn dockerfile_is_written_one_instruction_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("my_website");
        let lines = vec!["FROM ubuntu".to_string(), "RUN apt-get update".to_string()];
        let path = write_dockerfile(&folder, &lines).unwrap();
        assert_eq!(path, folder.join("Dockerfile"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "FROM ubuntu\nRUN apt-get update\n");
    }

    #[test]
    fn build_context_is_a_tarball_of_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        let bytes = tar_context(dir.path()).unwrap();
        assert!(!bytes.is_empty());
        let mut archive = tar::Archive::new(&bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
    }
}
