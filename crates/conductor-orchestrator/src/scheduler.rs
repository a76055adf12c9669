use crate::engine::OrchestrationEngine;
use conductor_core::ConductorResult;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Handles to the engine's periodic loops: dispatch, health check and
/// metrics collection.
///
/// Each loop first fires one full period after [`EngineRuntime::start`].
/// A tick that overruns delays the next one instead of bursting. Dropping
/// the runtime without calling [`EngineRuntime::stop`] leaves the loops
/// running for as long as the tokio runtime does.
pub struct EngineRuntime {
    handles: Vec<JoinHandle<()>>,
}

impl EngineRuntime {
    /// Spawn the three loops on the current tokio runtime. Fails if any
    /// configured period is zero.
    pub fn start(engine: Arc<OrchestrationEngine>) -> ConductorResult<Self> {
        let config = engine.config().clone();
        config.validate()?;
        info!(
            dispatch_ms = config.dispatch_interval_ms,
            health_check_ms = config.health_check_interval_ms,
            metrics_ms = config.metrics_interval_ms,
            "Starting orchestration loops"
        );

        let dispatch = {
            let engine = Arc::clone(&engine);
            spawn_loop("dispatch", config.dispatch_interval(), move || {
                let engine = Arc::clone(&engine);
                async move {
                    let assigned = engine.run_dispatch_cycle().await;
                    if !assigned.is_empty() {
                        debug!(count = assigned.len(), "Dispatch cycle assigned tasks");
                    }
                }
            })
        };
        let health = {
            let engine = Arc::clone(&engine);
            spawn_loop("health-check", config.health_check_interval(), move || {
                let engine = Arc::clone(&engine);
                async move {
                    engine.run_health_check().await;
                }
            })
        };
        let metrics = spawn_loop("metrics", config.metrics_interval(), move || {
            let engine = Arc::clone(&engine);
            async move {
                engine.collect_metrics().await;
            }
        });

        Ok(Self {
            handles: vec![dispatch, health, metrics],
        })
    }

    /// Whether any loop is still alive.
    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Abort all loops and wait for them to wind down.
    pub async fn stop(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            // Cancellation is the expected outcome here.
            let _ = handle.await;
        }
        info!("Orchestration loops stopped");
    }
}

fn spawn_loop<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            debug!(loop_name = name, "Tick");
            tick().await;
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::types::{AgentKind, AgentSpec, TaskPriority, TaskSpec, TaskStatus};

    fn config() -> EngineConfig {
        EngineConfig {
            dispatch_interval_ms: 100,
            health_check_interval_ms: 1_000,
            metrics_interval_ms: 500,
            ..EngineConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_loop_assigns_after_first_period() {
        let engine = Arc::new(OrchestrationEngine::new(config()));
        engine
            .register_agent(
                AgentSpec::new("w1", AgentKind::Worker, "w1").with_capabilities(["testing", "validation"]),
            )
            .await;
        let task = engine
            .create_task(TaskSpec::new("testing", TaskPriority::High))
            .await;

        let runtime = EngineRuntime::start(Arc::clone(&engine)).unwrap();
        assert!(runtime.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.get_task(&task).await.unwrap().status, TaskStatus::Pending);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.get_task(&task).await.unwrap().status, TaskStatus::Assigned);

        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_loop_records_snapshot() {
        let engine = Arc::new(OrchestrationEngine::new(config()));
        let runtime = EngineRuntime::start(Arc::clone(&engine)).unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(engine.get_system_status().await.last_metrics.is_some());

        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_loops() {
        let engine = Arc::new(OrchestrationEngine::new(config()));
        let runtime = EngineRuntime::start(engine).unwrap();
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_zero_period_rejected() {
        let config = EngineConfig {
            dispatch_interval_ms: 0,
            ..EngineConfig::default()
        };
        let engine = Arc::new(OrchestrationEngine::new(config));
        assert!(EngineRuntime::start(engine).is_err());
    }
}
