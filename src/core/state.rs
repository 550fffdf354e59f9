use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::core::config::Settings;
use crate::core::lockmanager::LockManager;
use crate::db::{self, Backend};
use crate::models::course::Course;
use crate::services::email::Mailer;
use crate::services::lms::{self, FakeLms, LmsAdapter};
use crate::services::sandbox::{self, DockerRunner, ImageBuilder, LocalRunner, Runner};

/// Process context shared by the API, the grader and the task engine.
#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    backend: Arc<dyn Backend>,
    locks: Arc<LockManager>,
    runner: Arc<dyn Runner>,
    images: ImageBuilder,
    mailer: Mailer,
    fake_lms: Arc<FakeLms>,
    shutdown: CancellationToken,
    task_wakeup: Notify,
}

impl AppState {
    /// Open the backend and connect to the container runtime unless it is disabled.
    pub(crate) async fn open(settings: Settings) -> anyhow::Result<Self> {
        let backend = db::open(&settings).await?;
        Self::with_backend(settings, backend)
    }

    pub(crate) fn with_backend(settings: Settings, backend: Arc<dyn Backend>) -> anyhow::Result<Self> {
        let locks = Arc::new(LockManager::new());
        let output_max_kb = settings.docker().output_max_kb;

        let docker = if settings.docker_enabled() { Some(sandbox::connect()?) } else { None };
        let runner: Arc<dyn Runner> = match &docker {
            Some(docker) => Arc::new(DockerRunner::new(docker.clone(), output_max_kb)),
            None => Arc::new(LocalRunner::new(output_max_kb)),
        };

        let images = ImageBuilder::new(
            docker,
            &settings.dirs().base.join("cache").join("images"),
            settings.grading().keep_build,
            locks.clone(),
        );
        let mailer = Mailer::new(settings.email(), settings.runtime().testing)?;

        tracing::info!(runner = runner.name(), backend = backend.name(), "Process state ready");

        Ok(Self {
            inner: Arc::new(InnerState {
                settings,
                backend,
                locks,
                runner,
                images,
                mailer,
                fake_lms: Arc::new(FakeLms::new()),
                shutdown: CancellationToken::new(),
                task_wakeup: Notify::new(),
            }),
        })
    }

    /// Stop background loops and release the backend.
    pub(crate) async fn close(&self) -> anyhow::Result<()> {
        self.inner.shutdown.cancel();
        self.inner.backend.close().await
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub(crate) fn locks(&self) -> &Arc<LockManager> {
        &self.inner.locks
    }

    pub(crate) fn runner(&self) -> &Arc<dyn Runner> {
        &self.inner.runner
    }

    pub(crate) fn images(&self) -> &ImageBuilder {
        &self.inner.images
    }

    pub(crate) fn mailer(&self) -> &Mailer {
        &self.inner.mailer
    }

    pub(crate) fn fake_lms(&self) -> &Arc<FakeLms> {
        &self.inner.fake_lms
    }

    pub(crate) fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Poked whenever active tasks change so the engine re-reads its next task.
    pub(crate) fn task_wakeup(&self) -> &Notify {
        &self.inner.task_wakeup
    }

    /// The course's LMS adapter, `None` when the course has no LMS.
    pub(crate) fn lms_for(&self, course: &Course) -> anyhow::Result<Option<Arc<dyn LmsAdapter>>> {
        course.lms.as_ref().map(|config| lms::adapter_for(config, &self.inner.fake_lms)).transpose()
    }
}
