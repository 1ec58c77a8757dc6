//! 认证失败记录的定期清理任务。

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::auth::AuthGateway;
use crate::config::FAILURE_PRUNE_INTERVAL_SECS;

/// 启动失败记录清理任务，开放访问模式下不启动。
pub fn spawn_background_tasks(gateway: Arc<AuthGateway>) {
    if gateway.is_open_access() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(FAILURE_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            gateway.failures.prune(Instant::now()).await;
            let tracked = gateway.failures.tracked().await;
            debug!(tracked, "pruned auth failure records");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{FailurePolicy, FailureStore};
    use std::net::{IpAddr, Ipv4Addr};

    fn gateway(secret: Option<&str>) -> Arc<AuthGateway> {
        Arc::new(AuthGateway {
            secret: secret.map(str::to_string),
            failures: FailureStore::new(FailurePolicy {
                max_failures: 5,
                window: Duration::from_millis(1),
                block: Duration::from_secs(60),
                max_tracked: 16,
            }),
            trust_forwarded_for: false,
        })
    }

    #[tokio::test]
    async fn prune_task_drops_expired_records() {
        let gateway = gateway(Some("secret"));
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        gateway.failures.register_failure(ip, Instant::now()).await;
        assert_eq!(gateway.failures.tracked().await, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        spawn_background_tasks(gateway.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(gateway.failures.tracked().await, 0);
    }

    #[tokio::test]
    async fn open_access_spawns_nothing() {
        let gateway = gateway(None);
        spawn_background_tasks(gateway.clone());
        assert_eq!(Arc::strong_count(&gateway), 1);
    }
}
