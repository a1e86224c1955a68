use chat_archiver::config::{CrawlConfig, SchedulerConfig};
use chat_archiver::models::{ChatKind, ChatMeta};
use chat_archiver::test_support::{MemoryConnector, ScriptedProvider, group, text_message, user};
use chat_archiver::{Daemon, DaemonConfig};
use std::time::Duration;

fn config() -> DaemonConfig {
    DaemonConfig {
        scheduler: SchedulerConfig {
            max_workers: 2,
            max_connections: 4,
            max_queued_tasks: 8,
            worker_idle_timeout: Duration::from_millis(50),
            worker_idle_cycles: 5,
            master_tick: Duration::from_millis(20),
        },
        crawl: CrawlConfig {
            fast_rounds: 3,
            fast_interval: Duration::from_millis(10),
            slow_rounds: 1,
            slow_interval: Duration::from_millis(30),
            chat_list_limit: 100,
            history_window: 100,
            busy_retry: Duration::from_millis(5),
            checkout_attempts: 3,
            checkout_retry: Duration::from_millis(5),
            include_private_chats: false,
        },
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recrawling_a_chat_does_not_duplicate_messages() {
    let provider = ScriptedProvider::new();
    let chat = group(-1001);
    provider.add_chat(chat.clone());
    provider.add_user(user(42));
    provider.add_user(user(43));
    provider.add_message(text_message(chat.id, 1, 42, "first"));
    provider.add_message(text_message(chat.id, 2, 43, "second"));
    provider.add_message(text_message(chat.id, 3, 42, "third"));

    let connector = MemoryConnector::new();
    let daemon =
        Daemon::start(config(), provider.clone(), connector.clone()).expect("daemon starts");

    eventually("two visits of the chat", || {
        provider
            .history_calls()
            .iter()
            .filter(|call| call.chat_id == chat.id)
            .count()
            >= 2
    })
    .await;

    assert_eq!(connector.message_rows(chat.id), 3);
    assert_eq!(connector.chat_rows(chat.id), 1);
    assert_eq!(connector.user_rows(42), 1);
    assert_eq!(connector.user_rows(43), 1);

    daemon.shutdown().await;
    let totals = daemon.crawl_totals();
    assert_eq!(totals.inserted, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn later_visits_resume_from_stored_bounds() {
    let provider = ScriptedProvider::new();
    let chat = group(-1002);
    provider.add_chat(chat.clone());
    provider.add_user(user(1));
    provider.add_message(text_message(chat.id, 50, 1, "old"));
    provider.add_message(text_message(chat.id, 60, 1, "new"));

    let daemon = Daemon::start(config(), provider.clone(), MemoryConnector::new())
        .expect("daemon starts");

    eventually("visits in both directions", || {
        let calls = provider.history_calls();
        calls.iter().any(|call| call.from_message_id == 50 && call.offset == 0)
            && calls.iter().any(|call| call.from_message_id == 60 && call.offset == -99)
    })
    .await;
    daemon.shutdown().await;

    let calls = provider.history_calls();
    assert_eq!(calls[0].from_message_id, 0);
    assert!(calls[1..].iter().all(|call| call.from_message_id != 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_groups_are_visited() {
    let provider = ScriptedProvider::new();
    let kinds = [
        (-1, ChatKind::Supergroup),
        (-2, ChatKind::BasicGroup),
        (-3, ChatKind::Channel),
        (4, ChatKind::Private),
        (5, ChatKind::Secret),
    ];
    for (id, kind) in kinds {
        provider.add_chat(ChatMeta {
            id,
            title: format!("chat {id}"),
            kind,
        });
    }

    let daemon = Daemon::start(config(), provider.clone(), MemoryConnector::new())
        .expect("daemon starts");
    eventually("both groups visited", || {
        let calls = provider.history_calls();
        calls.iter().any(|c| c.chat_id == -1) && calls.iter().any(|c| c.chat_id == -2)
    })
    .await;
    daemon.shutdown().await;

    assert!(
        provider
            .history_calls()
            .iter()
            .all(|call| call.chat_id == -1 || call.chat_id == -2)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_queue_delays_but_never_drops_chats() {
    let provider = ScriptedProvider::new();
    provider.set_latency(Duration::from_millis(2));
    provider.add_user(user(7));
    for id in 1..=6 {
        let chat = group(-id);
        provider.add_chat(chat.clone());
        provider.add_message(text_message(chat.id, 1, 7, "hello"));
    }

    let mut config = config();
    config.scheduler.max_workers = 1;
    config.scheduler.max_queued_tasks = 1;

    let connector = MemoryConnector::new();
    let daemon = Daemon::start(config, provider.clone(), connector.clone()).expect("daemon starts");

    eventually("every chat archived", || {
        (1..=6).all(|id| connector.message_rows(-id) == 1)
    })
    .await;

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_chat_lookup_skips_only_that_chat() {
    let provider = ScriptedProvider::new();
    provider.add_user(user(3));
    for id in [-10, -11] {
        provider.add_chat(group(id));
        provider.add_message(text_message(id, 1, 3, "hi"));
    }
    provider.fail_chat(-10);

    let connector = MemoryConnector::new();
    let daemon = Daemon::start(config(), provider.clone(), connector.clone()).expect("daemon starts");

    eventually("healthy chat archived", || connector.message_rows(-11) == 1).await;
    daemon.shutdown().await;

    assert_eq!(connector.message_rows(-10), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_is_idempotent_and_releases_resources() {
    let provider = ScriptedProvider::new();
    provider.add_chat(group(-20));

    let daemon = Daemon::start(config(), provider, MemoryConnector::new()).expect("daemon starts");
    tokio::time::sleep(Duration::from_millis(30)).await;

    tokio::time::timeout(Duration::from_secs(5), daemon.shutdown())
        .await
        .expect("shutdown completes");
    daemon.shutdown().await;

    assert!(daemon.locks().is_closed());
    assert_eq!(daemon.stats().active_workers, 0);
    assert_eq!(daemon.pool().in_use(), 0);
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let mut bad = config();
    bad.scheduler.max_workers = 0;
    assert!(Daemon::start(bad, ScriptedProvider::new(), MemoryConnector::new()).is_err());

    let mut bad = config();
    bad.crawl.history_window = 0;
    assert!(Daemon::start(bad, ScriptedProvider::new(), MemoryConnector::new()).is_err());
}
