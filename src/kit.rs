//! The kit: client surface and fleet orchestration.
//!
//! A [`Kit`] wires a backend, a handler, and a configuration together. It
//! submits tasks (`submit`) and runs the fleet, either blocking on the
//! current runtime until a shutdown signal (`run`) or spawning each service
//! on its own thread with a dedicated runtime (`launch`).

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::clock::{Clock, SystemClock};
use crate::config::KitConfig;
use crate::error::{ConveyorError, Result};
use crate::handler::TaskHandler;
use crate::result::ResultHandle;
use crate::scheduler::{Schedule, ScheduleEntry};
use crate::service::Service;
use crate::shutdown::install_shutdown_handler;
use crate::task::Task;

pub type ScheduleEntries = HashMap<String, Vec<ScheduleEntry>>;

#[derive(Clone)]
pub struct Kit {
    backend: Arc<dyn Backend>,
    handler: Arc<dyn TaskHandler>,
    clock: Arc<dyn Clock>,
    config: Arc<KitConfig>,
}

impl Kit {
    pub fn new(
        backend: Arc<dyn Backend>,
        handler: Arc<dyn TaskHandler>,
        config: KitConfig,
    ) -> Self {
        Self {
            backend,
            handler,
            clock: Arc::new(SystemClock),
            config: Arc::new(config),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &KitConfig {
        &self.config
    }

    /// Encode `value` through the handler, enqueue a fresh task, and return
    /// a handle for awaiting its result. `due` defaults to now.
    pub async fn submit(
        &self,
        group: impl Into<String>,
        name: impl Into<String>,
        value: &Value,
        due: Option<DateTime<Utc>>,
    ) -> Result<ResultHandle> {
        let group = group.into();
        let name = name.into();
        let data = self
            .handler
            .encode_data(&group, &name, value)
            .map_err(ConveyorError::Codec)?;
        let mut task = Task::new(group, name, data, due, self.clock.now());
        task.ttl = self.config.task_ttl;

        self.backend.enqueue(task.clone()).await?;
        tracing::debug!(task_id = %task.id, group = %task.group, name = %task.name, "task submitted");
        Ok(ResultHandle::new(
            task,
            Arc::clone(&self.backend),
            Arc::clone(&self.handler),
            Arc::clone(&self.clock),
        ))
    }

    /// Build a schedule entry whose `value` is encoded through the
    /// handler; the recurring-task counterpart of [`Kit::submit`].
    pub fn schedule_entry(
        &self,
        key: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
        value: &Value,
        schedule: impl Into<Schedule>,
    ) -> Result<ScheduleEntry> {
        let group = group.into();
        let name = name.into();
        let data = self
            .handler
            .encode_data(&group, &name, value)
            .map_err(ConveyorError::Codec)?;
        Ok(ScheduleEntry {
            key: key.into(),
            group,
            name,
            data,
            schedule: schedule.into(),
        })
    }

    /// Run the fleet on the current runtime until SIGTERM/SIGINT, then
    /// drain within the configured grace period.
    pub async fn run(&self, schedule_entries: ScheduleEntries) -> Result<()> {
        let shutdown = install_shutdown_handler();
        self.run_until(schedule_entries, shutdown).await
    }

    /// Like [`Kit::run`] but driven by a caller-provided token; used by the
    /// signal path and directly by tests.
    pub async fn run_until(
        &self,
        schedule_entries: ScheduleEntries,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.config.validate()?;
        let mut services = Vec::with_capacity(self.config.num_services);
        for index in 0..self.config.num_services {
            let service = Service::spawn(
                Arc::clone(&self.backend),
                Arc::clone(&self.handler),
                Arc::clone(&self.clock),
                Arc::clone(&self.config),
                &schedule_entries,
                index == 0,
                &shutdown,
            );
            match service {
                Ok(service) => services.push(service),
                Err(error) => {
                    // Unwind whatever already started before reporting.
                    shutdown.cancel();
                    for service in services {
                        service.drain().await;
                    }
                    return Err(error);
                }
            }
        }
        tracing::info!(services = services.len(), "fleet started");

        shutdown.cancelled().await;

        let drains: Vec<_> = services
            .into_iter()
            .map(|service| tokio::spawn(service.drain()))
            .collect();
        for drain in drains {
            let _ = drain.await;
        }
        tracing::info!("fleet stopped");
        Ok(())
    }

    /// Spawn each service on its own thread with a dedicated runtime and
    /// return the handles. Dropping a handle leaves its service running
    /// detached; use [`ServiceHandle::stop`] and [`ServiceHandle::join`]
    /// for an orderly stop.
    pub fn launch(&self, schedule_entries: ScheduleEntries) -> Result<Vec<ServiceHandle>> {
        self.config.validate()?;
        let mut handles = Vec::with_capacity(self.config.num_services);
        for index in 0..self.config.num_services {
            handles.push(self.launch_service(&schedule_entries, index == 0, index)?);
        }
        Ok(handles)
    }

    fn launch_service(
        &self,
        schedule_entries: &ScheduleEntries,
        run_schedulers: bool,
        index: usize,
    ) -> Result<ServiceHandle> {
        let shutdown = CancellationToken::new();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Control>();

        let backend = Arc::clone(&self.backend);
        let handler = Arc::clone(&self.handler);
        let clock = Arc::clone(&self.clock);
        let config = Arc::clone(&self.config);
        let entries = schedule_entries.clone();
        let token = shutdown.clone();

        let thread = thread::Builder::new()
            .name(format!("conveyor-service-{index}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        tracing::error!(%error, "failed to build service runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    let service = match Service::spawn(
                        backend,
                        handler,
                        clock,
                        config,
                        &entries,
                        run_schedulers,
                        &token,
                    ) {
                        Ok(service) => service,
                        Err(error) => {
                            tracing::error!(%error, "failed to start service");
                            return;
                        }
                    };
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            command = control_rx.recv() => match command {
                                Some(Control::Pause(groups)) => service.pause(groups.as_deref()),
                                Some(Control::Resume(groups)) => service.resume(groups.as_deref()),
                                // Handle dropped: run detached until the
                                // token (if anyone still holds it) fires.
                                None => {
                                    token.cancelled().await;
                                    break;
                                }
                            },
                        }
                    }
                    service.drain().await;
                });
            })
            .map_err(|e| ConveyorError::Spawn(e.to_string()))?;

        Ok(ServiceHandle {
            shutdown,
            control: control_tx,
            thread: Some(thread),
        })
    }
}

enum Control {
    Pause(Option<Vec<String>>),
    Resume(Option<Vec<String>>),
}

/// Handle to a service launched on its own thread.
pub struct ServiceHandle {
    shutdown: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServiceHandle {
    /// Request a graceful drain. Non-blocking; pair with [`join`].
    ///
    /// [`join`]: ServiceHandle::join
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Pause assignment for `groups`, or for all groups when `None`.
    pub fn pause(&self, groups: Option<Vec<String>>) {
        let _ = self.control.send(Control::Pause(groups));
    }

    pub fn resume(&self, groups: Option<Vec<String>>) {
        let _ = self.control.send(Control::Resume(groups));
    }

    /// Wait for the service thread to finish draining.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Stop and join, bounded only by the service's own grace period.
    pub fn stop_and_join(self) {
        self.stop();
        self.join();
    }
}
