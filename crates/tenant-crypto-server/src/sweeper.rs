use std::time::Duration;

use tenant_crypto::router::TenantCryptoService;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Rotates overdue keys every `interval` until the future is dropped. The
/// first sweep runs immediately.
pub async fn run_rotation_sweeper(service: TenantCryptoService, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match service.rotate_overdue_keys().await {
            Ok(rotated) if rotated.is_empty() => {}
            Ok(rotated) => info!(count = rotated.len(), "rotated overdue keys"),
            Err(e) => error!("rotation sweep failed: {e}"),
        }
    }
}
