use crate::config::RuntimeConfig;
use anyhow::{Context, Result};
use tokio::runtime::Runtime;

/// Multi-threaded runtime hosting the agents
pub fn create_runtime(config: &RuntimeConfig) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .max_blocking_threads(config.max_blocking_threads)
        .thread_name(config.thread_name.clone())
        .thread_stack_size(config.thread_stack_size)
        .enable_all()
        .build()
        .with_context(|| format!("building runtime with {} workers", config.worker_threads))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_runs_tasks() {
        let config = RuntimeConfig {
            worker_threads: 2,
            ..RuntimeConfig::default()
        };
        let rt = create_runtime(&config).unwrap();
        let value = rt.block_on(async { tokio::spawn(async { 40 + 2 }).await.unwrap() });
        assert_eq!(value, 42);
    }
}
