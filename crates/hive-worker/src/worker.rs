use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use hive_protocol::{
    AgentState, AgentStatus, HiveEvent, JobEnvelope, WorkerResponse, job_channel, now_epoch_ms,
    reply_channel,
};
use libhive::{AgentRegistry, StateStore, publish_event};

use crate::config::RuntimeConfig;

/// Run `program args...` with `input` on stdin and map the outcome to a reply.
///
/// Exit status zero yields the trimmed stdout as content. Spawn failures,
/// non-zero exits and timeouts yield an error reply; the child is killed when
/// the deadline passes.
pub async fn run_agent_command(
    program: &str,
    args: &[String],
    input: &str,
    limit: Duration,
) -> WorkerResponse {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return WorkerResponse::error(format!("failed to start {program}: {err}")),
    };

    if let Some(mut stdin) = child.stdin.take() {
        let input = input.to_owned();
        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(input.as_bytes()).await {
                debug!(error = %err, "agent closed stdin early");
            }
        });
    }

    match timeout(limit, child.wait_with_output()).await {
        Err(_) => WorkerResponse::error(format!(
            "{program} timed out after {}ms",
            limit.as_millis()
        )),
        Ok(Err(err)) => WorkerResponse::error(format!("{program} failed: {err}")),
        Ok(Ok(output)) if output.status.success() => {
            WorkerResponse::content(String::from_utf8_lossy(&output.stdout).trim_end())
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            WorkerResponse::error(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            ))
        }
    }
}

struct JobContext {
    cfg: RuntimeConfig,
    store: Arc<dyn StateStore>,
    registry: AgentRegistry,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
}

impl JobContext {
    async fn set_status(&self, status: AgentStatus, task: Option<&str>) {
        let mut state = AgentState::new(status, now_epoch_ms());
        if let Some(task) = task {
            state = state.with_task(task);
        }
        state
            .metadata
            .insert("workerType".into(), self.cfg.worker_type.clone().into());
        if let Err(err) = self.registry.update_agent_state(&self.cfg.agent_id, &state).await {
            warn!(agent_id = %self.cfg.agent_id, error = %err, "failed to record agent state");
        }
        self.announce(HiveEvent::AgentStatusChanged {
            agent_id: self.cfg.agent_id.clone(),
            status,
        })
        .await;
    }

    async fn announce(&self, event: HiveEvent) {
        if let Err(err) = publish_event(self.store.as_ref(), &event).await {
            warn!(error = %err, "failed to publish worker event");
        }
    }

    async fn handle_job(self: Arc<Self>, job: JobEnvelope) {
        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        let started = Instant::now();
        self.active.fetch_add(1, Ordering::SeqCst);
        self.set_status(AgentStatus::Working, Some(&job.id)).await;
        self.announce(HiveEvent::JobStarted {
            agent_id: self.cfg.agent_id.clone(),
            worker_type: self.cfg.worker_type.clone(),
            request_id: job.request_id.clone(),
        })
        .await;

        let response =
            run_agent_command(&self.cfg.program, &self.cfg.args, &job.content, self.cfg.job_timeout)
                .await;
        let ok = !response.is_error();

        match serde_json::to_string(&response) {
            Ok(payload) => {
                if let Err(err) = self
                    .store
                    .publish(&reply_channel(&job.request_id), &payload)
                    .await
                {
                    warn!(request_id = %job.request_id, error = %err, "failed to publish reply");
                }
            }
            Err(err) => warn!(request_id = %job.request_id, error = %err, "failed to encode reply"),
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.announce(HiveEvent::JobFinished {
            agent_id: self.cfg.agent_id.clone(),
            worker_type: self.cfg.worker_type.clone(),
            request_id: job.request_id.clone(),
            ok,
            elapsed_ms,
        })
        .await;
        if ok {
            info!(request_id = %job.request_id, elapsed_ms, "job completed");
        } else {
            warn!(request_id = %job.request_id, elapsed_ms, error = ?response.error, "job failed");
        }

        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            let status = if ok { AgentStatus::Idle } else { AgentStatus::Error };
            self.set_status(status, None).await;
        }
    }
}

pub struct Worker {
    ctx: Arc<JobContext>,
}

impl Worker {
    pub fn new(cfg: RuntimeConfig, store: Arc<dyn StateStore>) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_concurrency));
        Self {
            ctx: Arc::new(JobContext {
                registry: AgentRegistry::new(Arc::clone(&store)),
                cfg,
                store,
                permits,
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Consume jobs until `shutdown` flips to true or the job subscription
    /// ends. In-flight jobs are abandoned on shutdown and the agent is marked
    /// offline.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let ctx = &self.ctx;
        let channel = job_channel(&ctx.cfg.worker_type);
        let mut jobs = ctx.store.subscribe(&channel).await?;
        ctx.set_status(AgentStatus::Idle, None).await;
        info!(
            agent_id = %ctx.cfg.agent_id,
            channel = %channel,
            program = %ctx.cfg.program,
            max_concurrency = ctx.cfg.max_concurrency,
            "worker ready"
        );

        let mut heartbeat = interval(ctx.cfg.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested, stopping worker");
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = ctx.registry.touch_presence(&ctx.cfg.agent_id).await {
                        warn!(error = %err, "presence heartbeat failed");
                    }
                }
                raw = jobs.next() => {
                    let Some(raw) = raw else {
                        warn!(channel = %channel, "job subscription ended");
                        break;
                    };
                    match serde_json::from_str::<JobEnvelope>(&raw) {
                        Ok(job) => {
                            debug!(request_id = %job.request_id, "job received");
                            in_flight.spawn(Arc::clone(ctx).handle_job(job));
                        }
                        Err(err) => warn!(error = %err, "dropping malformed job envelope"),
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "job task failed");
                    }
                }
            }
        }

        in_flight.shutdown().await;
        jobs.close().await;
        ctx.set_status(AgentStatus::Offline, None).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_protocol::EVENTS_CHANNEL;
    use libhive::{JobDispatcher, JobRequest, MemoryStore};

    fn test_config(program: &str, args: &[&str]) -> RuntimeConfig {
        RuntimeConfig {
            agent_id: "gemini-test".into(),
            worker_type: "GEMINI".into(),
            redis_url: None,
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            max_concurrency: 2,
            job_timeout: Duration::from_secs(5),
            heartbeat: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn command_output_becomes_content() {
        let reply = run_agent_command("cat", &[], "hello agent\n", Duration::from_secs(5)).await;
        assert_eq!(reply.content.as_deref(), Some("hello agent"));
        assert_eq!(reply.error, None);
    }

    #[tokio::test]
    async fn command_failures_become_error_replies() {
        let args = vec!["-c".to_string(), "echo boom >&2; exit 2".to_string()];
        let reply = run_agent_command("sh", &args, "", Duration::from_secs(5)).await;
        let error = reply.error.expect("non-zero exit is an error");
        assert!(error.contains("boom"), "{error}");

        let reply = run_agent_command("hive-no-such-agent", &[], "", Duration::from_secs(5)).await;
        assert!(reply.error.unwrap().starts_with("failed to start"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let args = vec!["5".to_string()];
        let started = Instant::now();
        let reply = run_agent_command("sleep", &args, "", Duration::from_millis(100)).await;
        assert!(reply.error.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn worker_answers_jobs_and_tracks_state() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let registry = AgentRegistry::new(Arc::clone(&store));
        let mut events = store.subscribe(EVENTS_CHANNEL).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(test_config("tr", &["a-z", "A-Z"]), Arc::clone(&store));
        let run = tokio::spawn(async move { worker.run(shutdown_rx).await });

        // The worker marks itself idle once subscribed.
        timeout(Duration::from_secs(5), async {
            while registry.agent_state("gemini-test").await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let dispatcher = JobDispatcher::with_timeout(Arc::clone(&store), Duration::from_secs(5));
        let reply = dispatcher
            .dispatch("gemini", JobRequest::new("make me loud"))
            .await
            .unwrap();
        assert_eq!(reply.content.as_deref(), Some("MAKE ME LOUD"));

        let mut kinds = Vec::new();
        while kinds.len() < 5 {
            let raw = timeout(Duration::from_secs(5), events.next())
                .await
                .unwrap()
                .unwrap();
            let event: HiveEvent = serde_json::from_str(&raw).unwrap();
            kinds.push(match event {
                HiveEvent::JobStarted { .. } => "started",
                HiveEvent::JobFinished { ok, .. } => {
                    assert!(ok);
                    "finished"
                }
                HiveEvent::AgentStatusChanged { status, agent_id } => {
                    assert_eq!(agent_id, "gemini-test");
                    status.as_str()
                }
            });
        }
        // The initial idle was announced before the job arrived.
        assert_eq!(kinds, vec!["idle", "working", "started", "finished", "idle"]);

        timeout(Duration::from_secs(5), async {
            loop {
                let state = registry.agent_state("gemini-test").await.unwrap().unwrap();
                if state.status == AgentStatus::Idle {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker never returned to idle");
        assert!(
            registry
                .online_agents()
                .await
                .unwrap()
                .contains(&"gemini-test".to_string())
        );

        shutdown_tx.send_replace(true);
        run.await.unwrap().unwrap();
        let state = registry.agent_state("gemini-test").await.unwrap().unwrap();
        assert_eq!(state.status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn failed_job_marks_agent_error() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let registry = AgentRegistry::new(Arc::clone(&store));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(test_config("false", &[]), Arc::clone(&store));
        let run = tokio::spawn(async move { worker.run(shutdown_rx).await });

        timeout(Duration::from_secs(5), async {
            while store.active_subscriptions() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let dispatcher = JobDispatcher::with_timeout(Arc::clone(&store), Duration::from_secs(5));
        let reply = dispatcher
            .dispatch("GEMINI", JobRequest::new("anything"))
            .await
            .unwrap();
        assert!(reply.is_error());

        timeout(Duration::from_secs(5), async {
            loop {
                let state = registry.agent_state("gemini-test").await.unwrap();
                if state.is_some_and(|s| s.status == AgentStatus::Error) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("agent never reported the failure");

        shutdown_tx.send_replace(true);
        run.await.unwrap().unwrap();
    }
}
