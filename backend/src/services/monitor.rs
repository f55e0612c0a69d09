use crate::config::MonitorThresholds;
use crate::models::QueueHealth;
use crate::services::queue::CrawlQueue;
use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    BacklogSize,
    PendingAge,
    FailureRate,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

/// Operator notification channel. The real delivery mechanism lives outside
/// the core; the default sink surfaces alerts in the log.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert);
}

pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: Alert) {
        warn!("ALERT [{:?}]: {}", alert.kind, alert.message);
    }
}

/// Periodic queue health check. Strictly read-only over job state; it only
/// observes and alerts.
pub struct QueueMonitor {
    queue: Arc<CrawlQueue>,
    thresholds: MonitorThresholds,
    sink: Arc<dyn AlertSink>,
}

impl QueueMonitor {
    pub fn new(
        queue: Arc<CrawlQueue>,
        thresholds: MonitorThresholds,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        QueueMonitor {
            queue,
            thresholds,
            sink,
        }
    }

    pub async fn check(&self) -> QueueHealth {
        let health = self.queue.health(chrono::Utc::now().timestamp());
        info!(
            "Queue health: backlog={} (pending={}, in_flight={}, retrying={}), failed={}, failure_rate={:.2}",
            health.backlog(),
            health.pending,
            health.in_flight,
            health.retrying,
            health.failed,
            health.failure_rate()
        );

        if health.backlog() > self.thresholds.max_backlog {
            self.sink
                .raise(Alert {
                    kind: AlertKind::BacklogSize,
                    message: format!(
                        "crawl backlog at {} jobs (threshold {})",
                        health.backlog(),
                        self.thresholds.max_backlog
                    ),
                })
                .await;
        }

        if let Some(age) = health.oldest_pending_age_secs {
            if age > self.thresholds.max_pending_age.as_secs() as i64 {
                self.sink
                    .raise(Alert {
                        kind: AlertKind::PendingAge,
                        message: format!(
                            "oldest pending job is {age}s old (threshold {}s)",
                            self.thresholds.max_pending_age.as_secs()
                        ),
                    })
                    .await;
            }
        }

        if health.failure_rate() > self.thresholds.max_failure_rate {
            self.sink
                .raise(Alert {
                    kind: AlertKind::FailureRate,
                    message: format!(
                        "job failure rate at {:.2} (threshold {:.2})",
                        health.failure_rate(),
                        self.thresholds.max_failure_rate
                    ),
                })
                .await;
        }

        health
    }
}

/// The monitor trigger loop. Owns its own cron scheduler, independent of
/// queue dispatch.
pub async fn setup_monitoring(monitor: Arc<QueueMonitor>, schedule: &str) -> Result<JobScheduler> {
    info!("Setting up queue monitoring scheduler...");

    let sched = JobScheduler::new().await?;

    let monitor_job = Job::new_async(schedule, move |_uuid, _l| {
        let monitor = monitor.clone();
        Box::pin(async move {
            monitor.check().await;
        })
    })?;

    sched.add(monitor_job).await?;
    sched.start().await?;
    info!("Queue monitoring scheduler started.");
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::JobPriority;
    use crate::services::queue::MemJobStore;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingSink {
        alerts: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn raise(&self, alert: Alert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    fn thresholds(max_backlog: usize, max_failure_rate: f64) -> MonitorThresholds {
        MonitorThresholds {
            max_backlog,
            max_pending_age: Duration::from_secs(3600),
            max_failure_rate,
        }
    }

    #[tokio::test]
    async fn healthy_queue_raises_no_alerts() {
        let queue = Arc::new(CrawlQueue::new(Arc::new(MemJobStore::new())));
        queue.enqueue("vid-1", JobPriority::Discovery).await;
        let sink = Arc::new(RecordingSink {
            alerts: Mutex::new(Vec::new()),
        });
        let monitor = QueueMonitor::new(queue, thresholds(10, 0.5), sink.clone());

        let health = monitor.check().await;
        assert_eq!(health.pending, 1);
        assert!(sink.alerts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn backlog_over_threshold_raises_an_alert() {
        let queue = Arc::new(CrawlQueue::new(Arc::new(MemJobStore::new())));
        for i in 0..3 {
            queue.enqueue(&format!("vid-{i}"), JobPriority::Discovery).await;
        }
        let sink = Arc::new(RecordingSink {
            alerts: Mutex::new(Vec::new()),
        });
        let monitor = QueueMonitor::new(queue, thresholds(2, 0.5), sink.clone());

        monitor.check().await;
        let alerts = sink.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::BacklogSize);
    }

    #[tokio::test]
    async fn failure_rate_over_threshold_raises_an_alert() {
        let queue = Arc::new(CrawlQueue::new(Arc::new(MemJobStore::new())));
        let failing = queue.enqueue("vid-1", JobPriority::Discovery).await.job;
        queue.mark_in_flight(&failing.id).await.unwrap();
        queue.mark_failed(&failing.id, ErrorKind::Transient).await;

        let ok = queue.enqueue("vid-2", JobPriority::Discovery).await.job;
        queue.mark_in_flight(&ok.id).await.unwrap();
        queue.mark_succeeded(&ok.id).await;

        let sink = Arc::new(RecordingSink {
            alerts: Mutex::new(Vec::new()),
        });
        let monitor = QueueMonitor::new(queue, thresholds(100, 0.25), sink.clone());

        monitor.check().await;
        let alerts = sink.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::FailureRate);
    }
}
