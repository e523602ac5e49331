//! Campaign runner behavior end to end: suppression, pause, crash resume, warmup,
//! scheduling and the bounce-rate guard.

mod common;

use chrono::Utc;
use common::*;
use postern_engine::model::{
    AlertKind, Campaign, CampaignStatus, EmailStatus, NewEmail, Severity, Suppression,
    SuppressionSource, WarmupStatus,
};
use postern_engine::{BounceCheck, DeliveryStore, EngineError, RunOutcome};
use postern_queue::{MemoryBackend, Queue, QueueBackend};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

fn send_counts(h: &Harness) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for recipient in h.mock().recipients() {
        *counts.entry(recipient).or_insert(0) += 1;
    }
    counts
}

#[tokio::test(start_paused = true)]
async fn test_suppressed_recipients_never_reach_transport() {
    // user5 is suppressed by an earlier send's side effect, after the run has started.
    let h = harness_with(config(), |store| {
        let store = Arc::clone(store);
        HookTransport::new().on_send(move |n| {
            if n == 1 {
                store.add_suppression(Suppression::new(
                    ORG,
                    "user5@example.com",
                    "manual",
                    SuppressionSource::Manual,
                ));
            }
        })
    });
    seed_contacts(&h.store, 10);
    for address in ["user2@example.com", "USER7@example.com"] {
        h.store
            .suppress(Suppression::new(ORG, address, "manual", SuppressionSource::Manual))
            .await
            .unwrap();
    }
    let id = seed_campaign(&h.store);

    let outcome = h.engine.campaigns().run(id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { sent: 7, failed: 0 });

    for blocked in ["user2@example.com", "user5@example.com", "user7@example.com"] {
        assert!(!h.mock().was_sent_to(blocked), "{} was mailed", blocked);
    }
    assert_eq!(h.mock().sent_count(), 7);

    let campaign = h.campaign(id).await;
    assert_eq!(campaign.status, CampaignStatus::Sent);
    assert_eq!(campaign.sent_count, 7);
}

#[tokio::test(start_paused = true)]
async fn test_crash_resume_resends_at_most_unflushed_window() {
    // The store goes away right after the 13th message; progress was last flushed
    // at contact 10.
    let h = harness_with(config(), |store| {
        let store = Arc::clone(store);
        HookTransport::new().on_send(move |n| {
            if n == 13 {
                store.set_unavailable(true);
            }
        })
    });
    let contacts = seed_contacts(&h.store, 25);
    let id = seed_campaign(&h.store);

    assert!(h.engine.campaigns().run(id).await.is_err());
    assert!(!h.engine.campaigns().is_active(id));

    h.store.set_unavailable(false);
    let campaign = h.campaign(id).await;
    assert_eq!(campaign.status, CampaignStatus::Sending);
    assert_eq!(campaign.sent_count, 10);
    assert_eq!(campaign.cursor, contacts[9]);

    let outcome = h.engine.campaigns().run(id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { sent: 15, failed: 0 });

    let counts = send_counts(&h);
    assert_eq!(counts.len(), 25, "every contact is reached");
    for n in 1..=25 {
        let expected = if (11..=13).contains(&n) { 2 } else { 1 };
        assert_eq!(counts[&format!("user{}@example.com", n)], expected, "user{}", n);
    }

    let campaign = h.campaign(id).await;
    assert_eq!(campaign.status, CampaignStatus::Sent);
    assert_eq!(campaign.sent_count, 25);
}

#[tokio::test(start_paused = true)]
async fn test_pause_stops_with_exact_count_and_resume_finishes() {
    let mut config = config();
    config.campaign = config.campaign.with_rate_limit(10);
    let h = harness_with(config, |_| HookTransport::new());
    seed_contacts(&h.store, 20);
    let id = seed_campaign(&h.store);

    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.campaigns().run(id).await });

    // Ticks land at 0, 100, ..., 400ms.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(h.engine.campaigns().is_active(id));
    h.engine.campaigns().pause(id).await.unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Stopped { sent: 5, failed: 0 });
    assert_eq!(h.mock().sent_count(), 5);

    let campaign = h.campaign(id).await;
    assert_eq!(campaign.status, CampaignStatus::Paused);
    assert_eq!(campaign.sent_count, 5);

    h.engine.campaigns().resume(id).await.unwrap();
    h.drain().await;

    let counts = send_counts(&h);
    assert_eq!(counts.len(), 20);
    assert!(counts.values().all(|&n| n == 1));
    let campaign = h.campaign(id).await;
    assert_eq!(campaign.status, CampaignStatus::Sent);
    assert_eq!(campaign.sent_count, 20);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_final() {
    let h = harness();
    seed_contacts(&h.store, 3);
    let id = seed_campaign(&h.store);

    h.engine.campaigns().cancel(id).await.unwrap();
    assert_eq!(
        h.engine.campaigns().run(id).await.unwrap(),
        RunOutcome::Skipped(CampaignStatus::Cancelled)
    );
    assert!(h.engine.campaigns().resume(id).await.is_err());
    assert_eq!(h.mock().sent_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_warmup_schedule_caps_each_day() {
    let h = harness();
    h.engine
        .warmup()
        .register_schedule("ramp", vec![20, 50, 100]);
    h.engine.warmup().enroll(ORG, "ramp").await.unwrap();
    seed_contacts(&h.store, 200);
    let id = seed_campaign(&h.store);

    // Day 1: 20.
    let outcome = h.engine.campaigns().run(id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::WarmupLimited {
            limit: 20,
            sent: 20,
            failed: 0
        }
    );
    assert_eq!(h.campaign(id).await.status, CampaignStatus::Paused);

    // Resuming the same day sends nothing.
    h.engine.campaigns().resume(id).await.unwrap();
    h.drain().await;
    assert_eq!(h.mock().sent_count(), 20);

    // Day 2: pauses before the 51st send of the day.
    h.clock.advance_days(1);
    h.engine.campaigns().resume(id).await.unwrap();
    h.drain().await;
    assert_eq!(h.mock().sent_count(), 70);
    assert_eq!(h.campaign(id).await.status, CampaignStatus::Paused);

    // Day 3: 100.
    h.clock.advance_days(1);
    h.engine.campaigns().resume(id).await.unwrap();
    h.drain().await;
    assert_eq!(h.mock().sent_count(), 170);

    // Day 4: past the schedule, no ceiling.
    h.clock.advance_days(1);
    h.engine.campaigns().resume(id).await.unwrap();
    h.drain().await;
    assert_eq!(h.mock().sent_count(), 200);
    assert_eq!(h.engine.warmup().current_ceiling(ORG).await.unwrap(), 0);

    let campaign = h.campaign(id).await;
    assert_eq!(campaign.status, CampaignStatus::Sent);
    assert_eq!(campaign.sent_count, 200);
}

#[tokio::test(start_paused = true)]
async fn test_warmup_pause_raises_alert_and_resumes_next_day() {
    let h = harness();
    h.engine.warmup().register_schedule("hundred", vec![100, 200]);
    h.engine.warmup().enroll(ORG, "hundred").await.unwrap();
    seed_contacts(&h.store, 150);
    let id = seed_campaign(&h.store);

    h.engine.start_campaign(id).await.unwrap();
    h.drain().await;

    assert_eq!(h.mock().sent_count(), 100);
    let campaign = h.campaign(id).await;
    assert_eq!(campaign.status, CampaignStatus::Paused);
    assert_eq!(campaign.sent_count, 100);

    let alerts = h.store.alerts(Some(ORG)).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Warmup);
    assert_eq!(alerts[0].severity, Severity::Info);
    assert_eq!(alerts[0].title, "Warmup Daily Limit Reached");
    assert_eq!(alerts[0].data, serde_json::json!({"dailyLimit": 100}));

    h.clock.advance_days(1);
    h.engine.campaigns().resume(id).await.unwrap();
    h.drain().await;

    assert_eq!(h.mock().sent_count(), 150);
    let campaign = h.campaign(id).await;
    assert_eq!(campaign.status, CampaignStatus::Sent);
    assert_eq!(campaign.sent_count, 150);
    assert!(campaign.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_transactional_sends_count_toward_warmup() {
    let h = harness();
    h.engine.warmup().register_schedule("tiny", vec![5]);
    h.engine.warmup().enroll(ORG, "tiny").await.unwrap();
    seed_contacts(&h.store, 10);
    let id = seed_campaign(&h.store);

    for n in 0..3 {
        h.engine
            .send_email(
                postern_engine::model::NewEmail::new(ORG, "app@acme.test", "Receipt")
                    .to(format!("buyer{}@example.com", n)),
            )
            .await
            .unwrap();
    }

    let outcome = h.engine.campaigns().run(id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::WarmupLimited {
            limit: 5,
            sent: 2,
            failed: 0
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_suppressed_contact_at_ceiling_is_skipped_not_paused() {
    // The ceiling is hit exactly as the only remaining contact turns out suppressed.
    let h = harness_with(config(), |store| {
        let store = Arc::clone(store);
        HookTransport::new().on_send(move |n| {
            if n == 2 {
                store.add_suppression(Suppression::new(
                    ORG,
                    "user3@example.com",
                    "manual",
                    SuppressionSource::Manual,
                ));
            }
        })
    });
    h.engine.warmup().register_schedule("two", vec![2, 10]);
    h.engine.warmup().enroll(ORG, "two").await.unwrap();
    seed_contacts(&h.store, 3);
    let id = seed_campaign(&h.store);

    let outcome = h.engine.campaigns().run(id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { sent: 2, failed: 0 });
    assert_eq!(h.campaign(id).await.status, CampaignStatus::Sent);
    assert!(h.store.alerts(Some(ORG)).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_last_send_is_not_marked_sent() {
    let campaign_id = Arc::new(AtomicI64::new(0));
    let h = harness_with(config(), |store| {
        let store = Arc::clone(store);
        let campaign_id = Arc::clone(&campaign_id);
        HookTransport::new().on_send(move |n| {
            if n == 3 {
                store.edit_campaign(campaign_id.load(Ordering::SeqCst), |c| {
                    c.status = CampaignStatus::Cancelled;
                });
            }
        })
    });
    seed_contacts(&h.store, 3);
    let id = seed_campaign(&h.store);
    campaign_id.store(id, Ordering::SeqCst);

    let outcome = h.engine.campaigns().run(id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Stopped { sent: 3, failed: 0 });

    let campaign = h.campaign(id).await;
    assert_eq!(campaign.status, CampaignStatus::Cancelled);
    assert_eq!(campaign.sent_count, 3);
    assert!(campaign.completed_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_campaign_waits_for_its_time() {
    let backend = Arc::new(MemoryBackend::new());
    let h = harness_on(Queue::with_backend(backend.clone()));
    seed_contacts(&h.store, 3);
    let mut draft = Campaign::new(ORG, LIST, "Launch", "news@acme.test").html("<p>Soon</p>");
    draft.status = CampaignStatus::Draft;
    let id = h.store.add_campaign(draft);
    let at = Utc::now() + chrono::Duration::hours(2);

    let job_id = h.engine.schedule_campaign(id, at).await.unwrap();
    assert_eq!(h.campaign(id).await.status, CampaignStatus::Scheduled);
    assert_eq!(h.drain().await, 0);
    assert_eq!(h.mock().sent_count(), 0);
    assert_eq!(h.engine.queue().stats().await.unwrap().delayed, 1);

    let job = backend.pop(at).await.unwrap().unwrap();
    assert_eq!(job.id, job_id);
    h.engine.campaigns().handle(job).await.unwrap();
    assert_eq!(h.mock().sent_count(), 3);
    assert_eq!(h.campaign(id).await.status, CampaignStatus::Sent);

    assert!(matches!(
        h.engine.schedule_campaign(id, at).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_high_bounce_rate_pauses_warmup_and_sending_campaigns() {
    let h = harness();
    h.engine.warmup().enroll(ORG, "conservative").await.unwrap();
    for n in 0..100 {
        let email = h
            .store
            .create_email(NewEmail::new(ORG, "app@acme.test", "Hi").to(format!("r{}@example.com", n)))
            .await
            .unwrap();
        if n < 8 {
            h.store.set_email_status(email.id, EmailStatus::Bounced).await.unwrap();
        }
    }
    let sending = seed_campaign(&h.store);
    h.store
        .transition_campaign(sending, &[CampaignStatus::Scheduled], CampaignStatus::Sending)
        .await
        .unwrap();
    let waiting = seed_campaign(&h.store);

    let check = h.engine.check_bounce_rate(ORG).await.unwrap();
    assert!(matches!(check, BounceCheck::Paused(c) if c.bounced == 8));

    assert_eq!(h.campaign(sending).await.status, CampaignStatus::Paused);
    assert_eq!(h.campaign(waiting).await.status, CampaignStatus::Scheduled);
    assert_eq!(
        h.store.get_warmup(ORG).await.unwrap().unwrap().status,
        WarmupStatus::Paused
    );
    let alerts = h.store.alerts(Some(ORG)).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::BounceRate);
    assert_eq!(alerts[0].severity, Severity::Critical);
}
