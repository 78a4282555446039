use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broker::{Broker, NEWSLETTER_QUEUE};
use crate::compose::{Composer, Submission};
use crate::config::MailSettings;
use crate::context::Context;
use crate::error::MailError;
use crate::inbound::IntakeWorker;
use crate::models::{IncomingMailRepository, OutgoingMailRepository, SpamCheckLogRepository};
use crate::outbound::TransferWorker;
use crate::status::StatusReconciler;

/// Run a task forever on a fixed period until cancelled. Failures are
/// logged; the loop keeps going.
pub fn run_periodically<F, E, Fut>(task: F, period: Duration, cancel: CancellationToken)
where
    F: Fn() -> Fut + Send + 'static,
    E: Error,
    Fut: Future<Output = Result<(), E>> + Send,
{
    tokio::spawn(async move {
        loop {
            select!(
                _ = cancel.cancelled() => {
                    tracing::info!("Task cancelled");
                    return;
                },
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = task().await {
                        error!("periodic task failed: {e}");
                    }
                }
            )
        }
    });
}

/// Fires the background jobs on their cadence: every minute the outbound
/// drain and inbound intake, every two minutes status reconciliation and
/// the newsletter queue, daily the retention purges. A job name already in
/// flight is not enqueued twice.
pub struct Scheduler {
    pub transfer: Arc<TransferWorker>,
    pub intake: Arc<IntakeWorker>,
    pub reconciler: Arc<StatusReconciler>,
    pub composer: Arc<Composer>,
    pub broker: Broker,
    pub outgoing: OutgoingMailRepository,
    pub incoming: IncomingMailRepository,
    pub spam_logs: SpamCheckLogRepository,
    pub settings: MailSettings,
    pub shutdown: CancellationToken,
    in_flight: Arc<Mutex<HashSet<&'static str>>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: sqlx::PgPool,
        transfer: Arc<TransferWorker>,
        intake: Arc<IntakeWorker>,
        reconciler: Arc<StatusReconciler>,
        composer: Arc<Composer>,
        broker: Broker,
        settings: MailSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transfer,
            intake,
            reconciler,
            composer,
            broker,
            outgoing: OutgoingMailRepository::new(pool.clone()),
            incoming: IncomingMailRepository::new(pool.clone()),
            spam_logs: SpamCheckLogRepository::new(pool),
            settings,
            shutdown,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run a named job unless the previous run is still going.
    async fn guarded<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), MailError>>,
    {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(name) {
                debug!(job = name, "job already queued, skipping");
                return;
            }
        }

        if let Err(e) = task().await {
            error!(job = name, "job failed: {e}");
        }

        self.in_flight.lock().await.remove(name);
    }

    async fn transfer_mails(&self) -> Result<(), MailError> {
        self.transfer.transfer_pending().await
    }

    async fn get_incoming_mails(&self) -> Result<(), MailError> {
        self.intake.run_once().await.map(|_| ())
    }

    async fn get_outgoing_mails_status(&self) -> Result<(), MailError> {
        self.reconciler.run_once().await.map(|_| ())
    }

    /// Drain staged newsletter submissions and run each through the
    /// composer as a batched newsletter.
    async fn process_newsletter_queue(&self) -> Result<(), MailError> {
        self.broker.declare_queue(NEWSLETTER_QUEUE, 0).await?;
        let ctx = Context::system(&self.settings.postmaster);
        self.broker
            .drain(NEWSLETTER_QUEUE, |body, _app_id| {
                let ctx = ctx.clone();
                async move {
                    let mut submission: Submission = match serde_json::from_slice(&body) {
                        Ok(submission) => submission,
                        Err(e) => {
                            error!("undecodable newsletter submission, dropping: {e}");
                            return Ok(());
                        }
                    };
                    submission.is_newsletter = true;
                    submission.send_in_batch = true;
                    if let Err(e) = self.composer.submit(&ctx, submission).await {
                        // a bad submission must not wedge the queue
                        error!("newsletter submission rejected: {e}");
                    }
                    Ok(())
                }
            })
            .await
            .map(|_| ())
    }

    /// Daily retention pass.
    async fn purge(&self) -> Result<(), MailError> {
        let now = Utc::now();

        let newsletters = self
            .outgoing
            .purge_newsletters(now - ChronoDuration::days(self.settings.newsletter_retention as i64))
            .await?;
        let rejected = self
            .incoming
            .purge_rejected(
                now - ChronoDuration::days(self.settings.rejected_mail_retention as i64),
            )
            .await?;
        let spam_logs = self
            .spam_logs
            .purge(now - ChronoDuration::days(self.settings.spam_check_log_retention as i64))
            .await?;

        info!(newsletters, rejected, spam_logs, "retention purge done");
        Ok(())
    }

    /// Spawn the cadence loops. Each tick dispatches its jobs behind the
    /// duplicate-enqueue guard.
    pub fn spawn(self: Arc<Self>) {
        let minutely = self.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        minutely
                            .guarded("transfer_mails", || minutely.transfer_mails())
                            .await;
                        minutely
                            .guarded("get_incoming_mails", || minutely.get_incoming_mails())
                            .await;
                    }
                }
            }
        });

        let two_minutely = self.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(120));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        two_minutely
                            .guarded("get_outgoing_mails_status", || {
                                two_minutely.get_outgoing_mails_status()
                            })
                            .await;
                        two_minutely
                            .guarded("process_newsletter_queue", || {
                                two_minutely.process_newsletter_queue()
                            })
                            .await;
                    }
                }
            }
        });

        let daily = self;
        let cancel = daily.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        daily.guarded("purge", || daily.purge()).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn duplicate_job_names_are_skipped() {
        let in_flight: Arc<Mutex<HashSet<&'static str>>> = Arc::new(Mutex::new(HashSet::new()));

        // simulate a job still running
        in_flight.lock().await.insert("transfer_mails");
        assert!(!in_flight.lock().await.insert("transfer_mails"));

        // a different job is free to run
        assert!(in_flight.lock().await.insert("get_incoming_mails"));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn run_periodically_survives_task_errors() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let seen = counter.clone();
        run_periodically(
            move || {
                let seen = seen.clone();
                async move {
                    let n = seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n == 0 {
                        Err(std::fmt::Error)
                    } else {
                        Ok(())
                    }
                }
            },
            Duration::from_millis(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        // the first error was logged but did not stop the loop
        assert!(counter.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        assert!(logs_contain("periodic task failed"));
    }
}
