//! Pool of workers running queued jobs off the request path.
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{ExecError, Result};

#[derive(Debug, Clone)]
pub struct JobRunnerOpts {
    /// Max number of jobs running at once.
    pub workers: usize,
    pub health_check_interval: Duration,
}

impl Default for JobRunnerOpts {
    fn default() -> Self {
        JobRunnerOpts {
            workers: num_cpus::get(),
            health_check_interval: Duration::from_secs(2 * 60),
        }
    }
}

/// Runs background jobs with bounded parallelism.
///
/// Jobs beyond the worker count wait for a free worker in submission order.
#[derive(Debug, Clone)]
pub struct JobRunner {
    sender: mpsc::UnboundedSender<RequestMessage>,
    listen: Arc<Mutex<Option<JoinHandle<()>>>>,
}

#[derive(Debug)]
enum RequestMessage {
    NewJob(Arc<dyn BgJob>),
    JobComplete(String, Result<()>),
    HealthCheck,
    Close,
}

impl JobRunner {
    /// Start the runner. Must be called from within a tokio runtime.
    pub fn new(opts: JobRunnerOpts) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let health_sender = sender.clone();
        tokio::spawn(async move {
            let mut health_check = tokio::time::interval(opts.health_check_interval);
            loop {
                let _ = health_check.tick().await;
                if health_sender.send(RequestMessage::HealthCheck).is_err() {
                    debug!("exiting job runner health checker");
                    return;
                }
            }
        });

        let workers = Arc::new(Semaphore::new(opts.workers.max(1)));
        let listen_sender = sender.clone();
        let listen = tokio::spawn(async move { Self::listen(listen_sender, receiver, workers).await });
        JobRunner {
            sender,
            listen: Arc::new(Mutex::new(Some(listen))),
        }
    }

    async fn listen(
        sender: mpsc::UnboundedSender<RequestMessage>,
        mut receiver: mpsc::UnboundedReceiver<RequestMessage>,
        workers: Arc<Semaphore>,
    ) {
        let mut jobs: HashMap<String, JoinHandle<()>> = HashMap::new();
        while let Some(msg) = receiver.recv().await {
            match msg {
                RequestMessage::NewJob(job) => {
                    let job_name = job.name();
                    if jobs.contains_key(&job_name) {
                        warn!(%job_name, "job with the same name already queued, skipping");
                        continue;
                    }
                    debug!(%job_name, "queueing background job");

                    let sender = sender.clone();
                    let workers = workers.clone();
                    let name = job_name.clone();
                    let handle = tokio::spawn(async move {
                        let res = match workers.acquire_owned().await {
                            Ok(_permit) => job.start().await,
                            Err(_) => Err(ExecError::JobRunnerClosed),
                        };
                        if sender.send(RequestMessage::JobComplete(name.clone(), res)).is_err() {
                            debug!(job_name = %name, "background job finished after runner closed");
                        }
                    });
                    jobs.insert(job_name, handle);
                }
                RequestMessage::JobComplete(job_name, res) => {
                    match res {
                        Ok(()) => debug!(%job_name, "background job completed"),
                        Err(error) => error!(%job_name, %error, "background job exited with error"),
                    }
                    jobs.remove(&job_name);
                }
                RequestMessage::HealthCheck => {
                    // Panicked jobs never report completion.
                    jobs.retain(|_, handle| !handle.is_finished());
                }
                RequestMessage::Close => {
                    info!(pending = jobs.len(), "closing job runner, waiting for jobs to complete");
                    receiver.close();
                    for (_, handle) in jobs.drain() {
                        let _ = handle.await;
                    }
                    info!("all background jobs completed");
                    break;
                }
            }
        }
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn close(&self) -> Result<()> {
        self.sender
            .send(RequestMessage::Close)
            .map_err(|_| ExecError::JobRunnerClosed)?;

        let handle = match self.listen.lock().take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        let _ = handle.await;
        Ok(())
    }

    pub fn add(&self, job: Arc<dyn BgJob>) -> Result<()> {
        self.sender
            .send(RequestMessage::NewJob(job))
            .map_err(|e| {
                if let RequestMessage::NewJob(job) = &e.0 {
                    error!(job_name = %job.name(), "failed to queue background job");
                }
                ExecError::JobRunnerClosed
            })
    }
}

#[async_trait]
pub trait BgJob: Debug + Send + Sync {
    /// Unique name of the job. A job is skipped while another with the same
    /// name is queued or running.
    fn name(&self) -> String;

    async fn start(&self) -> Result<()>;
}
