//! Crawl limits, autoscaling feedback, migration, and pool integration.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use drover_autoscaling::{AutoscaledPoolOptions, Snapshotter, SnapshotterOptions};
use drover_browser::{BrowserPool, BrowserPoolOptions, MockBrowserBackend};
use drover_core::events::Event;
use drover_core::request::Request;
use drover_crawler::{Crawler, CrawlerConfig, CrawlerOptions, HandlerOutcome};
use drover_sessions::{SessionPool, SessionPoolOptions};
use drover_storage::kv::{KeyValueStore, MemoryKeyValueStore};
use drover_storage::memory_queue::MemoryRequestQueue;
use drover_storage::request_list::{RequestList, RequestListOptions, RequestListSource};
use drover_storage::request_queue::RequestQueue;

fn seed(path: &str) -> Request {
    Request::get(format!("https://example.com/{}", path)).unwrap()
}

fn fast_config() -> CrawlerConfig {
    CrawlerConfig {
        log_stats: false,
        autoscaling: AutoscaledPoolOptions {
            maybe_run_interval: Duration::from_millis(10),
            autoscale_interval: Duration::from_millis(500),
            ..AutoscaledPoolOptions::default()
        },
        ..CrawlerConfig::default()
    }
}

#[tokio::test]
async fn test_max_requests_per_crawl_stops_the_run() {
    let queue: Arc<MemoryRequestQueue> = Arc::new(MemoryRequestQueue::new());
    for path in ["r1", "r2", "r3", "r4"] {
        queue.add_request(seed(path), false).await.unwrap();
    }

    let handled = Arc::new(AtomicUsize::new(0));
    let handled_clone = handled.clone();
    let mut options = CrawlerOptions::new(Arc::new(move |_ctx| {
        let handled = handled_clone.clone();
        async move {
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::default())
        }
        .boxed()
    }));
    options.request_queue = Some(queue.clone());
    let mut config = CrawlerConfig {
        max_requests_per_crawl: Some(2),
        ..fast_config()
    };
    // One task at a time rules out in-flight overshoot.
    config.autoscaling.max_concurrency = 1;
    options.config = config;

    let crawler = Crawler::new(options).unwrap();
    crawler.run().await.unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 2);
    assert_eq!(crawler.handled_request_count(), 2);

    // The rest stays pending in the queue.
    assert!(queue.fetch_next_request().await.unwrap().is_some());
    assert!(queue.fetch_next_request().await.unwrap().is_some());
    assert!(queue.fetch_next_request().await.unwrap().is_none());
}

#[tokio::test]
async fn test_desired_concurrency_drops_under_memory_pressure() {
    let snapshotter = Arc::new(
        Snapshotter::new(SnapshotterOptions {
            max_memory_bytes: Some(1000),
            ..SnapshotterOptions::default()
        })
        .unwrap(),
    );

    let feeder = {
        let snapshotter = snapshotter.clone();
        tokio::spawn(async move {
            loop {
                snapshotter.record_memory_sample(990);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let queue: Arc<MemoryRequestQueue> = Arc::new(MemoryRequestQueue::new());
    for i in 0..500 {
        queue.add_request(seed(&format!("p{}", i)), false).await.unwrap();
    }

    let mut options = CrawlerOptions::new(Arc::new(move |_ctx| {
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(HandlerOutcome::default())
        }
        .boxed()
    }));
    options.request_queue = Some(queue);
    options.snapshotter = Some(snapshotter);
    options.config = CrawlerConfig {
        log_stats: false,
        autoscaling: AutoscaledPoolOptions {
            min_concurrency: 1,
            max_concurrency: 50,
            desired_concurrency: Some(10),
            maybe_run_interval: Duration::from_millis(10),
            autoscale_interval: Duration::from_millis(30),
            ..AutoscaledPoolOptions::default()
        },
        ..CrawlerConfig::default()
    };

    let crawler = Arc::new(Crawler::new(options).unwrap());
    let runner = {
        let crawler = crawler.clone();
        tokio::spawn(async move { crawler.run().await })
    };

    // Three scaling intervals at step ceil(10 * 0.05) = 1 each.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let desired = crawler.desired_concurrency().await.unwrap();
    assert!(desired <= 7, "expected scale-down, desired = {}", desired);
    assert!(desired >= 1);

    crawler.abort().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();
    feeder.abort();
}

#[tokio::test]
async fn test_migration_persists_and_restart_serves_only_unhandled() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let sources: Vec<RequestListSource> = (0..5)
        .map(|i| RequestListSource::Request(seed(&format!("m{}", i))))
        .collect();
    let list_options = || RequestListOptions {
        persist_state_key: Some("migration-state".into()),
        key_value_store: Some(store.clone()),
        ..RequestListOptions::default()
    };

    let handled_paths: Arc<tokio::sync::Mutex<Vec<String>>> =
        Arc::new(tokio::sync::Mutex::new(Vec::new()));

    fn make_handler(
        paths: Arc<tokio::sync::Mutex<Vec<String>>>,
    ) -> drover_crawler::RequestHandler {
        Arc::new(move |ctx: drover_crawler::HandlerContext| {
            let paths = paths.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                paths.lock().await.push(ctx.request.url.path().to_string());
                Ok(HandlerOutcome::default())
            }
            .boxed()
        })
    }

    // First run: migrate away mid-crawl.
    {
        let list = Arc::new(
            RequestList::open(sources.clone(), list_options()).await.unwrap(),
        );
        let mut options = CrawlerOptions::new(make_handler(handled_paths.clone()));
        options.request_list = Some(list);
        let mut config = fast_config();
        config.autoscaling.max_concurrency = 2;
        config.migration_grace = Duration::from_secs(5);
        options.config = config;

        let crawler = Arc::new(Crawler::new(options).unwrap());
        let runner = {
            let crawler = crawler.clone();
            tokio::spawn(async move { crawler.run().await })
        };

        while handled_paths.lock().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        crawler.events().emit(Event::Migrating);
        // Let the pause drain in-flight tasks and the state persist.
        tokio::time::sleep(Duration::from_millis(300)).await;
        crawler.abort().await;
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    let first_run_count = handled_paths.lock().await.len();
    assert!(first_run_count >= 1);
    assert!(first_run_count < 5, "migration should leave work undone");

    // Restart: the restored list serves only what was not handled.
    {
        let list = Arc::new(
            RequestList::open(sources.clone(), list_options()).await.unwrap(),
        );
        let mut options = CrawlerOptions::new(make_handler(handled_paths.clone()));
        options.request_list = Some(list);
        options.config = fast_config();

        let crawler = Crawler::new(options).unwrap();
        crawler.run().await.unwrap();
    }

    let handled = handled_paths.lock().await;
    let distinct: HashSet<&String> = handled.iter().collect();
    assert_eq!(distinct.len(), 5, "every seed handled at least once");
    // All in-flight tasks finished within the grace period, so nothing
    // was handled twice.
    assert_eq!(handled.len(), 5);
}

#[tokio::test]
async fn test_browser_and_session_pools_are_wired_through() {
    let queue: Arc<MemoryRequestQueue> = Arc::new(MemoryRequestQueue::new());
    for path in ["a", "b", "c"] {
        queue.add_request(seed(path), false).await.unwrap();
    }

    let backend = Arc::new(MockBrowserBackend::new());
    let browser_pool = BrowserPool::new(
        BrowserPoolOptions {
            instance_kill_settle: Duration::from_millis(10),
            process_kill_timeout: Duration::from_millis(10),
            housekeeping_interval: Duration::from_millis(10),
            ..BrowserPoolOptions::default()
        },
        backend.clone(),
    );
    let session_pool = SessionPool::open(
        SessionPoolOptions {
            max_pool_size: 2,
            persist_state_key: None,
            ..SessionPoolOptions::default()
        },
        None,
        None,
    )
    .await
    .unwrap();

    let pages_seen = Arc::new(AtomicUsize::new(0));
    let pages_clone = pages_seen.clone();
    let mut options = CrawlerOptions::new(Arc::new(move |ctx: drover_crawler::HandlerContext| {
        let pages = pages_clone.clone();
        async move {
            let page = ctx.page.expect("handler should receive a page");
            assert!(page.is_open().await);
            assert!(ctx.session.is_some());
            pages.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::default())
        }
        .boxed()
    }));
    options.request_queue = Some(queue);
    options.browser_pool = Some(browser_pool.clone());
    options.session_pool = Some(session_pool.clone());
    options.config = fast_config();

    let crawler = Crawler::new(options).unwrap();
    let stats = crawler.run().await.unwrap();

    assert_eq!(stats.requests_handled, 3);
    assert_eq!(pages_seen.load(Ordering::SeqCst), 3);
    assert!(session_pool.len().await >= 1);

    browser_pool.destroy().await.unwrap();
    assert_eq!(backend.alive_count(), 0);
}
