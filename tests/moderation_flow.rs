//! End-to-end moderation scenarios against the in-process transport.

mod common;

use chatguard::identity::{ChatId, IdentityError, SenderId};
use chatguard::moderation::{
    DeleteReason, IgnoreReason, ModerationConfig, ModerationDispatcher, ModerationError,
    ModerationStore, MutedUserSummary, Verdict,
};
use chrono::{Duration, Utc};
use common::{text_message, FakeTransport, ADMIN, GROUP, SPAMMER};
use std::sync::Arc;

fn engine(config: ModerationConfig) -> ModerationDispatcher {
    let store = Arc::new(ModerationStore::new(&config));
    ModerationDispatcher::new(config, store)
}

fn default_engine() -> ModerationDispatcher {
    engine(ModerationConfig::default())
}

#[tokio::test]
async fn long_message_mutes_sender_and_follow_up_is_deleted() -> Result<(), IdentityError> {
    let dispatcher = default_engine();
    let transport = FakeTransport::default();
    let sender = SenderId::from_address(SPAMMER)?;
    let now = Utc::now();

    let spam = text_message(GROUP, SPAMMER, "M1", &"a".repeat(200), now);
    let verdict = dispatcher.moderate(&transport, &spam, None, now).await;
    assert_eq!(verdict, Verdict::SpamDetected { char_count: 200 });
    assert_eq!(transport.deleted_ids(), vec!["M1".to_string()]);

    assert_eq!(
        dispatcher.store().muted_users(now),
        vec![MutedUserSummary {
            user_id: sender.clone(),
            remaining_minutes: 10,
            deleted_messages: 1,
        }]
    );
    let Some(first) = dispatcher.store().mute_record(&sender) else {
        panic!("expected a mute record");
    };

    let later = now + Duration::seconds(1);
    let follow_up = text_message(GROUP, SPAMMER, "M2", "short one", later);
    let verdict = dispatcher.moderate(&transport, &follow_up, None, later).await;
    assert_eq!(
        verdict,
        Verdict::Deleted {
            reason: DeleteReason::UserMuted {
                remaining_minutes: 10
            }
        }
    );

    let Some(second) = dispatcher.store().mute_record(&sender) else {
        panic!("mute record vanished");
    };
    assert_eq!(second.message_count, 2);
    assert_eq!(second.muted_until, first.muted_until, "mute must not be extended");
    assert_eq!(transport.deleted_ids().len(), 2);
    // Muted senders are never told
    assert!(transport.sent_texts().is_empty());
    Ok(())
}

#[tokio::test]
async fn banned_sender_never_gets_through() -> Result<(), IdentityError> {
    let dispatcher = default_engine();
    let transport = FakeTransport::default();
    let sender = SenderId::from_address(SPAMMER)?;
    assert!(dispatcher.store().ban(&sender, false));

    let start = Utc::now();
    for i in 0..12 {
        let at = start + Duration::seconds(i * 5);
        let msg = text_message(GROUP, SPAMMER, &format!("B{i}"), "hello", at);
        let verdict = dispatcher.moderate(&transport, &msg, None, at).await;
        assert_eq!(
            verdict,
            Verdict::Deleted {
                reason: DeleteReason::PermanentlyMuted
            },
            "message {i} slipped through"
        );
    }
    assert_eq!(transport.deleted_ids().len(), 12);

    assert!(dispatcher.store().unban_user(&sender));
    assert!(!dispatcher.store().unban_user(&sender));
    let at = start + Duration::minutes(5);
    let msg = text_message(GROUP, SPAMMER, "B99", "hello again", at);
    assert!(matches!(
        dispatcher.moderate(&transport, &msg, None, at).await,
        Verdict::Allowed { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn third_link_promotes_to_ban_with_public_notice() -> Result<(), IdentityError> {
    let dispatcher = default_engine();
    let transport = FakeTransport::default();
    let start = Utc::now();

    let mut verdicts = Vec::new();
    for i in 0..3 {
        let at = start + Duration::seconds(i * 10);
        let msg = text_message(GROUP, SPAMMER, &format!("L{i}"), "join chat.whatsapp.com/AbCdEf", at);
        verdicts.push(dispatcher.moderate(&transport, &msg, None, at).await);
    }
    assert_eq!(
        verdicts,
        vec![
            Verdict::LinkDeleted { warnings: 1, banned: false },
            Verdict::LinkDeleted { warnings: 2, banned: false },
            Verdict::LinkDeleted { warnings: 3, banned: true },
        ]
    );
    let spammer = SenderId::from_address(SPAMMER)?;
    assert!(dispatcher.store().is_banned(&spammer));

    let sent = transport.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, ChatId::new(GROUP));
    assert!(sent[0].1.text.contains(&format!("@{SPAMMER} permanently muted")));
    assert_eq!(sent[0].1.mentions, vec![spammer.to_user_address()]);

    let other = "2348099999999";
    for i in 0..2 {
        let at = start + Duration::seconds(i * 10);
        let msg = text_message(GROUP, other, &format!("O{i}"), "see https://example.com", at);
        dispatcher.moderate(&transport, &msg, None, at).await;
    }
    let other = SenderId::from_address(other)?;
    assert!(!dispatcher.store().is_banned(&other));
    assert_eq!(
        dispatcher.store().link_violation(&other).map(|v| v.warnings),
        Some(2)
    );
    Ok(())
}

#[tokio::test]
async fn burst_of_messages_is_flagged_as_bot() -> Result<(), IdentityError> {
    let dispatcher = default_engine();
    let transport = FakeTransport::default();
    let start = Utc::now();

    let mut last = None;
    for i in 0..5 {
        let at = start + Duration::milliseconds(i * 500);
        let msg = text_message(GROUP, SPAMMER, &format!("R{i}"), "hi", at);
        last = Some(dispatcher.moderate(&transport, &msg, None, at).await);
    }
    assert_eq!(last, Some(Verdict::BotDetected));
    let bot = SenderId::from_address(SPAMMER)?;
    assert!(dispatcher.store().is_banned(&bot));
    assert_eq!(dispatcher.store().bot_suspects(), vec![bot]);

    let human = "2348077777777";
    for i in 0..5 {
        let at = start + Duration::milliseconds(i * 750);
        let msg = text_message(GROUP, human, &format!("H{i}"), "hi", at);
        let verdict = dispatcher.moderate(&transport, &msg, None, at).await;
        assert!(matches!(verdict, Verdict::Allowed { .. }), "{verdict:?}");
    }
    Ok(())
}

#[tokio::test]
async fn rapid_edits_of_one_message_are_flagged_as_bot() -> Result<(), IdentityError> {
    let dispatcher = default_engine();
    let transport = FakeTransport::default();
    let start = Utc::now();

    let mut verdicts = Vec::new();
    for i in 0..3 {
        let at = start + Duration::milliseconds(i * 600);
        let edit = text_message(GROUP, SPAMMER, &format!("E{i}"), "buy now", at).with_edit_of("ORIG");
        verdicts.push(dispatcher.moderate(&transport, &edit, None, at).await);
    }
    assert!(matches!(verdicts[0], Verdict::Allowed { .. }), "{:?}", verdicts[0]);
    assert!(matches!(verdicts[1], Verdict::Allowed { .. }), "{:?}", verdicts[1]);
    assert_eq!(verdicts[2], Verdict::BotDetected);
    let bot = SenderId::from_address(SPAMMER)?;
    assert!(dispatcher.store().is_banned(&bot));
    assert_eq!(dispatcher.store().bot_suspects(), vec![bot]);
    assert_eq!(transport.deleted_ids(), vec!["E2".to_string()]);

    // Same count of edits spread over the full window reads as a person
    let human = "2348077777777";
    for i in 0..3 {
        let at = start + Duration::milliseconds(i * 1000);
        let edit = text_message(GROUP, human, &format!("H{i}"), "typo fixed", at).with_edit_of("HUMAN");
        let verdict = dispatcher.moderate(&transport, &edit, None, at).await;
        assert!(matches!(verdict, Verdict::Allowed { .. }), "{verdict:?}");
    }
    assert!(!dispatcher.store().is_banned(&SenderId::from_address(human)?));
    Ok(())
}

#[tokio::test]
async fn admins_and_owner_are_exempt() -> Result<(), IdentityError> {
    let dispatcher = default_engine();
    let transport = FakeTransport::with_admins(&[ADMIN]);
    let owner = SenderId::from_address("2348011111111")?;
    let now = Utc::now();

    let from_admin = text_message(GROUP, ADMIN, "A1", &"x".repeat(500), now);
    assert_eq!(
        dispatcher.moderate(&transport, &from_admin, Some(&owner), now).await,
        Verdict::Ignored {
            reason: IgnoreReason::Admin
        }
    );

    let from_owner = text_message(GROUP, owner.as_str(), "O1", "https://example.com", now);
    assert_eq!(
        dispatcher.moderate(&transport, &from_owner, Some(&owner), now).await,
        Verdict::Ignored {
            reason: IgnoreReason::Owner
        }
    );
    assert!(transport.deleted_ids().is_empty());
    Ok(())
}

#[tokio::test]
async fn history_scan_cleans_up_old_spam() -> Result<(), ModerationError> {
    let dispatcher = engine(ModerationConfig {
        scan_delete_pause_ms: 0,
        ..ModerationConfig::default()
    });
    let transport = FakeTransport::with_admins(&[ADMIN]);
    let now = Utc::now();

    let long = "y".repeat(300);
    let mut history = Vec::new();
    for i in 0..120 {
        let at = now - Duration::minutes(i);
        let (sender, text) = match i {
            5 | 70 => (SPAMMER, long.as_str()),
            40 => ("2348055555555", long.as_str()),
            90 => (ADMIN, long.as_str()),
            _ => ("2348066666666", "normal chat"),
        };
        history.push(text_message(GROUP, sender, &format!("H{i}"), text, at));
    }
    *transport.history.lock() = history;

    let report = dispatcher
        .scan_and_delete_spam(&transport, &ChatId::new(GROUP), None)
        .await?;

    assert_eq!(report.scanned, 120);
    assert_eq!(report.pages, 3);
    assert!(!report.truncated);
    assert_eq!(report.spam_found, 3);
    assert_eq!(report.deleted, 3);
    assert_eq!(report.users_muted, 2);
    assert_eq!(report.errors, 0);
    assert_eq!(
        transport.deleted_ids(),
        vec!["H5".to_string(), "H40".to_string(), "H70".to_string()]
    );
    assert!(report.render().contains(&format!("@{SPAMMER}")));
    Ok(())
}

#[tokio::test]
async fn history_scan_respects_page_cap() -> Result<(), ModerationError> {
    let dispatcher = engine(ModerationConfig {
        scan_page_size: 10,
        scan_max_pages: 2,
        ..ModerationConfig::default()
    });
    let transport = FakeTransport::default();
    let now = Utc::now();
    *transport.history.lock() = (0..50)
        .map(|i| text_message(GROUP, "2348066666666", &format!("H{i}"), "ok", now))
        .collect();

    let report = dispatcher
        .scan_and_delete_spam(&transport, &ChatId::new(GROUP), None)
        .await?;
    assert_eq!(report.scanned, 20);
    assert!(report.truncated);
    assert_eq!(
        transport
            .history_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        2
    );
    Ok(())
}
