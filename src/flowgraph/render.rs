use super::FlowGraphPhase;
use crate::process::{self, ProcessInvocation};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("phase {0} has not been written to disk")]
    NotPersisted(String),

    #[error("graphviz failed: {0}")]
    Tool(String),

    #[error("graphviz did not produce {}", .0.display())]
    MissingImage(PathBuf),

    #[error("rendering was cancelled")]
    Cancelled,
}

/// Each `dot` process pins one core; leave half of them to everything else.
pub fn default_render_capacity() -> usize {
    (num_cpus::get() / 2).max(2)
}

/// Renders persisted phase graphs to PNG with graphviz `dot`.
///
/// At most `capacity` renders run at once; the rest wait for a permit in request order.
#[derive(Debug, Clone)]
pub struct FlowGraphRenderer {
    dot_path: PathBuf,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl FlowGraphRenderer {
    pub fn new(dot_path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(dot_path, default_render_capacity())
    }

    pub fn with_capacity(dot_path: impl Into<PathBuf>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            dot_path: dot_path.into(),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn dot_path(&self) -> &Path {
        &self.dot_path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Renders currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn image_path(dot_file: &Path) -> PathBuf {
        let mut name = dot_file.as_os_str().to_owned();
        name.push(".png");
        PathBuf::from(name)
    }

    /// Render one phase, reusing an image left by an earlier render.
    pub async fn render(
        &self,
        phase: &FlowGraphPhase,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RenderError> {
        let dot_file = phase
            .file_path
            .as_deref()
            .ok_or_else(|| RenderError::NotPersisted(phase.identifier()))?;
        let image = Self::image_path(dot_file);
        if image.exists() {
            return Ok(image);
        }

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(RenderError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| RenderError::Cancelled)?,
        };
        tracing::debug!(
            "rendering {} ({} of {} slots busy)",
            phase.identifier(),
            self.in_flight(),
            self.capacity
        );

        let invocation = ProcessInvocation::new(&self.dot_path)
            .arg("-Tpng")
            .arg(format!("-o{}", image.display()))
            .arg("-Kdot")
            .arg(dot_file.display().to_string())
            .cancellation(cancel.clone());
        let result = process::run(&invocation, None).await;

        if result.cancelled {
            return Err(RenderError::Cancelled);
        }
        if !result.stderr.is_empty() {
            return Err(RenderError::Tool(result.stderr));
        }
        if !image.exists() {
            return Err(RenderError::MissingImage(image));
        }
        Ok(image)
    }

    /// Render every phase concurrently, bounded by the renderer's capacity.
    pub async fn render_all(
        &self,
        phases: &[FlowGraphPhase],
        cancel: &CancellationToken,
    ) -> Vec<Result<PathBuf, RenderError>> {
        futures::future::join_all(phases.iter().map(|phase| self.render(phase, cancel))).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};

    /// A stand-in for `dot` that sleeps, then touches the `-o` target.
    fn fake_dot(dir: &Path) -> PathBuf {
        let path = dir.join("fake-dot");
        std::fs::write(
            &path,
            "#!/bin/sh\nsleep 0.3\nfor a in \"$@\"; do case \"$a\" in -o*) : > \"${a#-o}\";; esac; done\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn persisted_phases(dir: &Path, count: u32) -> Vec<FlowGraphPhase> {
        (1..=count)
            .map(|i| {
                let path = dir.join(format!("{i}. Phase.dot"));
                std::fs::write(&path, "digraph FlowGraph {\n}\n").unwrap();
                FlowGraphPhase {
                    ordinal: i,
                    absolute_ordinal: i,
                    name: "Phase".into(),
                    graph_text: String::new(),
                    file_path: Some(path),
                }
            })
            .collect()
    }

    #[test]
    fn capacity_is_at_least_two() {
        assert!(default_render_capacity() >= 2);
        assert_eq!(FlowGraphRenderer::with_capacity("dot", 0).capacity(), 1);
    }

    #[tokio::test]
    async fn renders_are_admitted_in_bounded_batches() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FlowGraphRenderer::with_capacity(fake_dot(dir.path()), 2);
        let phases = persisted_phases(dir.path(), 4);

        let started = Instant::now();
        let results = renderer.render_all(&phases, &CancellationToken::new()).await;

        assert!(results.iter().all(|r| r.is_ok()));
        // Four 0.3s renders through two slots need at least two rounds.
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(renderer.in_flight(), 0);
    }

    #[tokio::test]
    async fn existing_image_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let phases = persisted_phases(dir.path(), 1);
        let image = FlowGraphRenderer::image_path(phases[0].file_path.as_ref().unwrap());
        std::fs::write(&image, b"png").unwrap();

        let renderer = FlowGraphRenderer::new("/no/such/dot");
        let rendered = renderer.render(&phases[0], &CancellationToken::new()).await.unwrap();
        assert_eq!(rendered, image);
    }

    #[tokio::test]
    async fn unpersisted_phase_is_rejected() {
        let mut phase = persisted_phases(tempfile::tempdir().unwrap().path(), 1).remove(0);
        phase.file_path = None;
        let renderer = FlowGraphRenderer::new("dot");
        let err = renderer.render(&phase, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RenderError::NotPersisted(_)));
    }
}
