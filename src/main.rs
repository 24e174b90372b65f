// Entry point for the ident service

use anyhow::Result;
use svc_harness::HarnessError;
use svc_harness::harness;
use svc_harness::ident::IdentService;

#[tokio::main]
async fn main() -> Result<()> {
    match harness::run(IdentService).await {
        Ok(()) => Ok(()),
        // The service's own failure is the process's final error, unchanged
        Err(HarnessError::Run(e)) => Err(e),
        Err(e) => Err(anyhow::Error::new(e).context("Failed to start service")),
    }
}
