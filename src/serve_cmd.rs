use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::service::PipelineService;
use crate::{PipelineResult, build_runtime, server};

pub fn run(config: ServiceConfig) -> PipelineResult<()> {
    info!(
        uploads = %config.uploads_dir.display(),
        max_upload_bytes = config.max_upload_bytes,
        stage_timeout_secs = config.stage_timeout_secs,
        retain = ?config.retain_workspaces,
        "starting service"
    );
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let service = Arc::new(PipelineService::from_config(config));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received");
                    let _ = tx.send(true);
                }
                Err(e) => {
                    warn!("cannot listen for ctrl-c: {e}");
                    // Keep the sender alive so the servers only stop on their own.
                    std::future::pending::<()>().await;
                }
            }
        });
        server::serve(service, rx).await
    })
}
