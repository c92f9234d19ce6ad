// End-to-end behaviour of the lifecycle engine against a recording platform
// and a manually advanced clock.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use rusqlite::Connection;
use tokio::sync::watch;
use vault_core::config::SchedulerConfig;
use vault_core::{Amount, Clock, ManualClock, PrivilegeId, Reward, SubjectId, WeightedReward};
use vault_ledger::Ledger;
use vault_lifecycle::testing::MockPlatform;
use vault_lifecycle::types::{
    AwardStatus, ContestStatus, EffectKind, HeistStatus, NewContest, NewEffect, OfferPick,
};
use vault_lifecycle::{
    ClaimOutcome, DailyWindow, EntityKey, HeistSettings, JoinOutcome, LifecycleEngine,
    LifecycleError, LifecycleRunner, LifecycleStore, Resolution, RewardOutcome, SubmitOutcome,
};

struct Harness {
    engine: LifecycleEngine,
    runner: Option<LifecycleRunner>,
    platform: Arc<MockPlatform>,
    clock: Arc<ManualClock>,
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn heist_settings() -> HeistSettings {
    HeistSettings {
        window: DailyWindow::new(
            chrono_tz::UTC,
            NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
        )
        .unwrap(),
        code_length: 4,
        reward: Amount::from(5000),
        privilege: Some(PrivilegeId::from("vault-master")),
        privilege_duration: Duration::days(1),
    }
}

fn harness_at(start: DateTime<Utc>) -> Harness {
    let store = LifecycleStore::new(Connection::open_in_memory().unwrap()).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let ledger = Ledger::new(
        Connection::open_in_memory().unwrap(),
        Amount::from(1000),
        clock.clone(),
    )
    .unwrap();
    let platform = Arc::new(MockPlatform::with_contexts(&["g1"]));
    let (engine, runner) = LifecycleEngine::new(
        store,
        ledger,
        platform.clone(),
        clock.clone(),
        SchedulerConfig::default(),
        heist_settings(),
    );
    Harness {
        engine,
        runner: Some(runner),
        platform,
        clock,
    }
}

fn harness() -> Harness {
    harness_at(noon())
}

/// Another engine over the same database and platform, as a second process
/// would run it. It shares no in-memory state with `h.engine`.
fn second_engine(h: &Harness) -> LifecycleEngine {
    let (engine, _runner) = LifecycleEngine::new(
        h.engine.store().clone(),
        h.engine.ledger().clone(),
        h.platform.clone(),
        h.clock.clone(),
        SchedulerConfig::default(),
        heist_settings(),
    );
    engine
}

fn contest(h: &Harness, ends_in: Duration, winners: u32, reward: Reward) -> NewContest {
    NewContest {
        context: "g1".into(),
        channel: "giveaways".into(),
        title: "Spring giveaway".into(),
        reward,
        ends_at: h.clock.now() + ends_in,
        winner_count: winners,
        host: Some("host".into()),
    }
}

fn balance(h: &Harness, subject: &str) -> Amount {
    h.engine
        .ledger()
        .account(&SubjectId::from(subject))
        .unwrap()
        .balance
}

#[tokio::test]
async fn due_rows_are_resolved_exactly_once() {
    let h = harness();
    let vip = PrivilegeId::from("vip");
    for (subject, minutes) in [("u1", 1), ("u2", 5), ("u3", 30)] {
        h.engine
            .privileges()
            .grant(&subject.into(), &"g1".into(), &vip, Duration::minutes(minutes))
            .await
            .unwrap();
    }
    h.engine
        .effects()
        .start(NewEffect {
            subject: "u4".into(),
            context: "g1".into(),
            kind: EffectKind::PrivilegeGrant,
            payload: "vip".into(),
            restore: None,
            expires_at: Some(h.clock.now() + Duration::minutes(10)),
        })
        .await
        .unwrap();

    h.clock.advance(Duration::hours(1));
    for _ in 0..2 {
        h.engine.sweep_privileges().await.unwrap();
        h.engine.sweep_effects().await.unwrap();
    }

    for subject in ["u1", "u2", "u3", "u4"] {
        assert_eq!(h.platform.grants_for(subject), 1, "{subject} granted");
        assert_eq!(h.platform.revokes_for(subject), 1, "{subject} revoked");
    }
}

#[tokio::test]
async fn resolving_twice_has_no_extra_effect() {
    let h = harness();
    let (subject, vip) = (SubjectId::from("u1"), PrivilegeId::from("vip"));
    h.engine
        .privileges()
        .grant(&subject, &"g1".into(), &vip, Duration::seconds(30))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(1));

    let first = h.engine.privileges().resolve(&subject, &vip).await.unwrap();
    let second = h.engine.privileges().resolve(&subject, &vip).await.unwrap();
    assert_eq!(first, Resolution::Resolved);
    assert_eq!(second, Resolution::AlreadyResolved);
    assert_eq!(h.platform.revokes_for("u1"), 1);
}

#[tokio::test]
async fn reconcile_recovers_overdue_work_without_timers() {
    let h = harness();
    let store = h.engine.store();
    let now = h.clock.now();
    let past = now - Duration::hours(2);

    store
        .upsert_privilege(&"u1".into(), &"vip".into(), Some(&"g1".into()), past, past)
        .unwrap();
    store
        .upsert_privilege(&"u2".into(), &"vip".into(), None, now + Duration::hours(3), past)
        .unwrap();
    let effect = store
        .insert_effect(
            &NewEffect {
                subject: "u3".into(),
                context: "g1".into(),
                kind: EffectKind::NicknameOverride,
                payload: "Champion".into(),
                restore: Some("carol".into()),
                expires_at: Some(past),
            },
            past,
        )
        .unwrap();
    let overdue = store
        .insert_contest(
            &NewContest {
                ends_at: past,
                ..contest(&h, Duration::zero(), 1, Reward::Draws { count: 1 })
            },
            past - Duration::hours(1),
        )
        .unwrap();
    assert_eq!(h.engine.timers().armed_count(), 0);

    let report = h.engine.reconcile().await;

    assert_eq!(report.privileges.resolved, 1);
    assert_eq!(report.effects.resolved, 1);
    assert_eq!(report.contests.resolved, 1);
    assert_eq!(report.armed, 1);
    assert_eq!(h.platform.revokes_for("u1"), 1);
    assert_eq!(
        h.platform.display_names_for("u3"),
        vec![Some("carol".to_string())]
    );
    assert!(!store.effect(&effect.id).unwrap().unwrap().active);
    assert_eq!(
        store.contest(&overdue.id).unwrap().unwrap().status,
        ContestStatus::Ended
    );
    assert!(h
        .engine
        .timers()
        .is_armed(&EntityKey::privilege(&"u2".into(), &"vip".into())));
}

#[tokio::test]
async fn regrant_replaces_expiry() {
    let h = harness();
    let (subject, vip) = (SubjectId::from("u1"), PrivilegeId::from("vip"));
    h.engine
        .privileges()
        .grant(&subject, &"g1".into(), &vip, Duration::hours(1))
        .await
        .unwrap();
    h.engine
        .privileges()
        .grant(&subject, &"g1".into(), &vip, Duration::hours(3))
        .await
        .unwrap();

    let rows = h.engine.store().privileges_for(&subject).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].expires_at.timestamp(),
        (h.clock.now() + Duration::hours(3)).timestamp()
    );
}

#[tokio::test]
async fn contest_with_fewer_entrants_than_winners() {
    let h = harness();
    let created = h
        .engine
        .contests()
        .create(contest(
            &h,
            Duration::milliseconds(1000),
            5,
            Reward::Balance {
                amount: Amount::from(250),
            },
        ))
        .await
        .unwrap();
    for subject in ["a", "b", "c"] {
        let joined = h
            .engine
            .contests()
            .join(&created.id, &subject.into())
            .unwrap();
        assert_eq!(joined, JoinOutcome::Joined);
    }
    assert_eq!(
        h.engine.contests().join(&created.id, &"a".into()).unwrap(),
        JoinOutcome::AlreadyJoined
    );

    h.clock.advance(Duration::seconds(2));
    assert_eq!(
        h.engine.contests().join(&created.id, &"late".into()).unwrap(),
        JoinOutcome::Closed
    );
    let stats = h.engine.sweep_contests().await.unwrap();
    assert_eq!(stats.resolved, 1);

    let stored = h.engine.contests().contest(&created.id).unwrap();
    assert_eq!(stored.status, ContestStatus::Ended);
    let draws = h.engine.contests().draws(&created.id).unwrap();
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].winners.len(), 3);
    for subject in ["a", "b", "c"] {
        assert_eq!(balance(&h, subject), Amount::from(1250));
    }
    // Announcement edited with the results, plus a fresh results notice.
    assert_eq!(h.platform.edits().len(), 1);
    assert_eq!(h.platform.notices().len(), 2);
}

#[tokio::test]
async fn empty_contest_draws_nobody_twice() {
    let h = harness();
    let created = h
        .engine
        .contests()
        .create(contest(&h, Duration::minutes(1), 3, Reward::Draws { count: 1 }))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(2));

    let resolution = h.engine.contests().resolve(&created.id).await.unwrap();
    assert_eq!(resolution, Resolution::Resolved);
    let reroll = h.engine.contests().reroll(&created.id).await.unwrap();
    assert!(reroll.draw.winners.is_empty());

    let draws = h.engine.contests().draws(&created.id).unwrap();
    assert_eq!(draws.len(), 2);
    assert!(draws.iter().all(|d| d.winners.is_empty()));
}

#[tokio::test]
async fn each_reroll_distributes_again() {
    let h = harness();
    let created = h
        .engine
        .contests()
        .create(contest(&h, Duration::minutes(1), 2, Reward::Draws { count: 1 }))
        .await
        .unwrap();
    for subject in ["a", "b"] {
        h.engine
            .contests()
            .join(&created.id, &subject.into())
            .unwrap();
    }
    h.clock.advance(Duration::minutes(2));
    h.engine.contests().resolve(&created.id).await.unwrap();

    let first = h.engine.contests().reroll(&created.id).await.unwrap();
    let second = h.engine.contests().reroll(&created.id).await.unwrap();
    assert_eq!(first.draw.draw_no, 2);
    assert_eq!(second.draw.draw_no, 3);
    assert!(first.awards.iter().all(|a| a.outcome.is_some()));

    for subject in ["a", "b"] {
        let account = h
            .engine
            .ledger()
            .account(&subject.into())
            .unwrap();
        assert_eq!(account.draws, 3);
    }
}

#[tokio::test]
async fn reroll_and_cancel_respect_status() {
    let h = harness();
    let created = h
        .engine
        .contests()
        .create(contest(&h, Duration::minutes(1), 1, Reward::Draws { count: 1 }))
        .await
        .unwrap();

    let err = h.engine.contests().reroll(&created.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidTransition { .. }));

    h.engine.contests().cancel(&created.id).await.unwrap();
    assert!(h.engine.contests().cancel(&created.id).await.is_err());
    h.clock.advance(Duration::minutes(2));
    assert_eq!(
        h.engine.contests().resolve(&created.id).await.unwrap(),
        Resolution::AlreadyResolved
    );
    assert!(h.engine.contests().draws(&created.id).unwrap().is_empty());
}

#[tokio::test]
async fn choice_reward_waits_for_claim() {
    let h = harness();
    let reward = Reward::Choice {
        guaranteed: Box::new(Reward::Balance {
            amount: Amount::from(100),
        }),
        alternatives: vec![WeightedReward {
            weight: 1,
            reward: Reward::Draws { count: 5 },
        }],
    };
    let created = h
        .engine
        .contests()
        .create(contest(&h, Duration::minutes(1), 1, reward))
        .await
        .unwrap();
    h.engine
        .contests()
        .join(&created.id, &"a".into())
        .unwrap();
    h.clock.advance(Duration::minutes(2));
    h.engine.contests().resolve(&created.id).await.unwrap();
    assert_eq!(balance(&h, "a"), Amount::from(1000));

    let offers = h.engine.store().pending_offers(&"a".into()).unwrap();
    assert_eq!(offers.len(), 1);
    let offer_id = offers[0].id.clone();

    let claimed = h
        .engine
        .contests()
        .claim_offer(&offer_id, &"a".into(), OfferPick::Guaranteed)
        .await
        .unwrap();
    assert!(matches!(
        claimed,
        ClaimOutcome::Claimed {
            outcome: RewardOutcome::Credited { .. },
            ..
        }
    ));
    assert_eq!(balance(&h, "a"), Amount::from(1100));

    let again = h
        .engine
        .contests()
        .claim_offer(&offer_id, &"a".into(), OfferPick::Gamble)
        .await
        .unwrap();
    assert_eq!(again, ClaimOutcome::AlreadyClaimed);
}

#[tokio::test]
async fn heist_runs_from_pending_to_cracked() {
    let h = harness();
    let heists = h.engine.heists();
    let created = heists
        .create(&"g1".into(), &"vault".into(), "the city bank")
        .await
        .unwrap();
    assert_eq!(created.status, HeistStatus::Pending);
    assert_eq!(h.platform.is_locked("vault"), Some(true));

    let early = heists
        .submit(&"g1".into(), &"thief".into(), &created.code)
        .await
        .unwrap();
    assert_eq!(early, SubmitOutcome::NotOpen);

    h.clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 20, 1, 0).unwrap());
    h.engine.sweep_heists().await.unwrap();
    assert_eq!(heists.heist(&created.id).unwrap().status, HeistStatus::Active);
    assert_eq!(h.platform.is_locked("vault"), Some(false));

    let wrong = if created.code == "0000" { "1111" } else { "0000" };
    assert_eq!(
        heists.submit(&"g1".into(), &"thief".into(), wrong).await.unwrap(),
        SubmitOutcome::Wrong
    );

    let won = heists
        .submit(&"g1".into(), &"thief".into(), &created.code)
        .await
        .unwrap();
    assert!(matches!(won, SubmitOutcome::Won { .. }));

    let closed = heists.heist(&created.id).unwrap();
    assert_eq!(closed.status, HeistStatus::Closed);
    assert_eq!(closed.winner, Some(SubjectId::from("thief")));
    assert_eq!(closed.attempts, 1);
    assert_eq!(h.platform.is_locked("vault"), Some(true));
    assert_eq!(balance(&h, "thief"), Amount::from(6000));
    assert_eq!(
        h.engine
            .store()
            .privileges_for(&"thief".into())
            .unwrap()
            .len(),
        1
    );

    let late = heists
        .submit(&"g1".into(), &"rival".into(), &created.code)
        .await
        .unwrap();
    assert_eq!(late, SubmitOutcome::NoHeist);
    assert_eq!(balance(&h, "thief"), Amount::from(6000));
}

#[tokio::test]
async fn heist_creation_is_single_instance_and_time_gated() {
    let h = harness();
    let heists = h.engine.heists();
    let first = heists
        .create(&"g1".into(), &"vault".into(), "bank")
        .await
        .unwrap();
    let err = heists
        .create(&"g1".into(), &"vault".into(), "bank")
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::HeistAlreadyRunning { id } if id == first.id));

    // The next morning the leftover heist is stale and gets force-closed.
    h.clock.set(Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap());
    let second = heists
        .create(&"g1".into(), &"vault".into(), "bank")
        .await
        .unwrap();
    assert_eq!(heists.heist(&first.id).unwrap().status, HeistStatus::Closed);
    assert_eq!(second.status, HeistStatus::Pending);

    heists.cancel(&second.id).await.unwrap();
    h.clock.set(Utc.with_ymd_and_hms(2024, 5, 2, 23, 0, 0).unwrap());
    let err = heists
        .create(&"g1".into(), &"vault".into(), "bank")
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::HeistWindowClosed));
}

#[tokio::test]
async fn reconcile_closes_heist_past_its_window() {
    let h = harness_at(Utc.with_ymd_and_hms(2024, 5, 1, 20, 30, 0).unwrap());
    let heist = h
        .engine
        .heists()
        .create(&"g1".into(), &"vault".into(), "bank")
        .await
        .unwrap();
    assert_eq!(heist.status, HeistStatus::Active);

    h.clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 22, 5, 0).unwrap());
    h.engine.reconcile().await;
    let closed = h.engine.heists().heist(&heist.id).unwrap();
    assert_eq!(closed.status, HeistStatus::Closed);
    assert!(closed.winner.is_none());
    assert_eq!(h.platform.is_locked("vault"), Some(true));
}

#[tokio::test]
async fn runner_dispatches_timers_until_shutdown() {
    let mut h = harness();
    let runner = h.runner.take().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(runner.run(shutdown_rx));

    h.engine
        .privileges()
        .grant(&"u1".into(), &"g1".into(), &"vip".into(), Duration::zero())
        .await
        .unwrap();

    let revoked = tokio::time::timeout(StdDuration::from_secs(5), async {
        while h.platform.revokes_for("u1") == 0 {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await;
    assert!(revoked.is_ok(), "timer never resolved the privilege");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("runner did not stop")
        .unwrap();
    assert_eq!(h.platform.revokes_for("u1"), 1);
}

#[tokio::test]
async fn racing_engines_revoke_a_privilege_once() {
    let h = harness();
    let other = second_engine(&h);
    let (subject, vip) = (SubjectId::from("u1"), PrivilegeId::from("vip"));
    h.engine
        .privileges()
        .grant(&subject, &"g1".into(), &vip, Duration::seconds(30))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(1));

    let (a, b) = tokio::join!(
        h.engine.privileges().resolve(&subject, &vip),
        other.privileges().resolve(&subject, &vip),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes.iter().filter(|o| **o == Resolution::Resolved).count(),
        1
    );
    assert!(outcomes.contains(&Resolution::AlreadyResolved));
    assert_eq!(h.platform.grants_for("u1"), 1);
    assert!(h.engine.store().privilege(&subject, &vip).unwrap().is_none());
}

#[tokio::test]
async fn racing_engines_draw_a_contest_once() {
    let h = harness();
    let other = second_engine(&h);
    let created = h
        .engine
        .contests()
        .create(contest(&h, Duration::minutes(1), 1, Reward::Draws { count: 2 }))
        .await
        .unwrap();
    h.engine
        .contests()
        .join(&created.id, &"a".into())
        .unwrap();
    h.clock.advance(Duration::minutes(2));

    let (x, y) = tokio::join!(
        h.engine.contests().resolve(&created.id),
        other.contests().resolve(&created.id),
    );
    let outcomes = [x.unwrap(), y.unwrap()];
    assert!(outcomes.contains(&Resolution::Resolved));
    assert!(outcomes.contains(&Resolution::AlreadyResolved));
    assert_eq!(h.engine.contests().draws(&created.id).unwrap().len(), 1);
    assert_eq!(h.engine.ledger().account(&"a".into()).unwrap().draws, 2);
}

#[tokio::test]
async fn contest_prize_hit_by_transient_failure_is_retried() {
    let h = harness();
    let reward = Reward::TimedPrivilege {
        privilege: "vip".into(),
        duration_secs: 3600,
    };
    let created = h
        .engine
        .contests()
        .create(contest(&h, Duration::minutes(1), 1, reward))
        .await
        .unwrap();
    h.engine
        .contests()
        .join(&created.id, &"w".into())
        .unwrap();
    h.clock.advance(Duration::minutes(2));

    h.platform.mark_transient("w");
    assert_eq!(h.engine.sweep_contests().await.unwrap().resolved, 1);
    assert_eq!(h.platform.grants_for("w"), 0);
    assert_eq!(
        h.engine.contests().contest(&created.id).unwrap().status,
        ContestStatus::Ended
    );
    let owed = h.engine.store().contest_awards(&created.id).unwrap();
    assert_eq!(owed.len(), 1);
    assert_eq!(owed[0].status, AwardStatus::Pending);

    h.platform.clear_transient("w");
    assert_eq!(h.engine.sweep_awards().await.unwrap().resolved, 1);
    assert_eq!(h.platform.grants_for("w"), 1);

    h.engine.sweep_contests().await.unwrap();
    h.engine.sweep_awards().await.unwrap();
    assert_eq!(h.platform.grants_for("w"), 1);
    assert_eq!(h.engine.contests().draws(&created.id).unwrap().len(), 1);
    assert_eq!(
        h.engine.store().contest_awards(&created.id).unwrap()[0].status,
        AwardStatus::Done
    );
}

#[tokio::test]
async fn heist_privilege_hit_by_transient_failure_is_settled_on_reconcile() {
    let h = harness_at(Utc.with_ymd_and_hms(2024, 5, 1, 20, 30, 0).unwrap());
    let heist = h
        .engine
        .heists()
        .create(&"g1".into(), &"vault".into(), "bank")
        .await
        .unwrap();

    h.platform.mark_transient("thief");
    let won = h
        .engine
        .heists()
        .submit(&"g1".into(), &"thief".into(), &heist.code)
        .await
        .unwrap();
    assert_eq!(
        won,
        SubmitOutcome::Won {
            heist_id: heist.id.clone(),
            credited: Some(Amount::from(5000)),
            privilege: None,
        }
    );
    assert_eq!(balance(&h, "thief"), Amount::from(6000));
    assert!(h
        .engine
        .store()
        .privileges_for(&"thief".into())
        .unwrap()
        .is_empty());

    h.platform.clear_transient("thief");
    let report = h.engine.reconcile().await;
    assert_eq!(report.awards.resolved, 1);
    assert_eq!(h.platform.grants_for("thief"), 1);
    assert_eq!(
        h.engine
            .store()
            .privileges_for(&"thief".into())
            .unwrap()
            .len(),
        1
    );
    assert_eq!(balance(&h, "thief"), Amount::from(6000));
}

#[tokio::test]
async fn submit_opens_a_pending_heist_whose_window_has_started() {
    let h = harness();
    let heists = h.engine.heists();
    let created = heists
        .create(&"g1".into(), &"vault".into(), "the city bank")
        .await
        .unwrap();
    assert_eq!(created.status, HeistStatus::Pending);

    // No sweep or timer has run since the window opened.
    h.clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 30).unwrap());
    let won = heists
        .submit(&"g1".into(), &"thief".into(), &created.code)
        .await
        .unwrap();
    assert!(matches!(won, SubmitOutcome::Won { .. }));

    let closed = heists.heist(&created.id).unwrap();
    assert_eq!(closed.status, HeistStatus::Closed);
    assert!(closed.opened_at.is_some());
    assert_eq!(closed.winner, Some(SubjectId::from("thief")));
    assert_eq!(h.platform.is_locked("vault"), Some(true));
}
