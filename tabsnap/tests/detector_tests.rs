use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tabsnap::snapshot::SNAP_ID_ATTRIBUTE;
use tabsnap::{
    AgentSession, ChangeDetector, DetectorOptions, Document, IdentityMap, Scheduler,
    SnapshotEngine, SnapshotOptions, SnapshotUpdate,
};
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

async fn next_update(rx: &mut mpsc::UnboundedReceiver<SnapshotUpdate>) -> SnapshotUpdate {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a snapshot")
        .expect("detector dropped its sink")
}

fn ids_in(html: &str) -> Vec<String> {
    let needle = format!("{SNAP_ID_ATTRIBUTE}=\"");
    html.match_indices(&needle)
        .map(|(at, _)| {
            let rest = &html[at + needle.len()..];
            rest[..rest.find('"').unwrap_or(rest.len())].to_string()
        })
        .collect()
}

#[test]
fn snapshots_are_idempotent_and_ids_stable() {
    let doc = Document::parse(
        "https://example.com/",
        r#"<body><p>Intro</p><a href="/next">Next</a><button>Go</button></body>"#,
    )
    .unwrap();
    let engine = SnapshotEngine::new(SnapshotOptions::agent()).unwrap();
    let body = doc.body().unwrap();

    let first = engine.snapshot(&body, &IdentityMap::new());
    let second = engine.snapshot(&body, &first.identities);
    assert_eq!(first.html, second.html);
    assert_eq!(ids_in(&first.html).len(), 2);

    // Adding an element keeps the ids already handed out.
    let extra = doc.create_element("input");
    body.append_child(&extra).unwrap();
    let third = engine.snapshot(&body, &second.identities);
    let before = ids_in(&second.html);
    let after = ids_in(&third.html);
    assert_eq!(after.len(), 3);
    assert!(before.iter().all(|id| after.contains(id)));

    let mut unique = after.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), after.len());

    // The live tree never gains the id attribute.
    assert!(!doc.outer_html().contains(SNAP_ID_ATTRIBUTE));
}

#[tokio::test]
async fn publishes_on_change_only() {
    init_tracing();
    let doc = Document::parse(
        "https://example.com/",
        r#"<body><div id="list"></div><input name="q"></body>"#,
    )
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let detector = ChangeDetector::start(
        doc.clone(),
        None,
        DetectorOptions::agent(),
        Arc::new(tx),
        Scheduler::new(),
    )
    .unwrap();

    let initial = next_update(&mut rx).await;
    assert_eq!(initial.sequence, 0);
    assert!(initial.catalog.contains("click"));

    let list = doc.element_by_id("list").unwrap();
    let button = doc.create_element("button");
    button.append_child(&doc.create_text_node("Save")).unwrap();
    list.append_child(&button).unwrap();

    let update = next_update(&mut rx).await;
    assert_eq!(update.sequence, 1);
    assert!(update.html.contains("Save"));
    assert_eq!(detector.html(), update.html);
    assert_eq!(ids_in(&update.html).len(), 2);

    // Property edits are not mutations; refresh picks them up.
    let input = doc.query_all("input").remove(0);
    input.set_value("typed").unwrap();
    assert!(detector.refresh());
    let update = next_update(&mut rx).await;
    assert!(update.html.contains(r#"value="typed""#));
    assert!(!detector.refresh());

    detector.stop();
    assert!(detector.is_stopped());
}

#[tokio::test]
async fn same_origin_frames_are_inlined_and_followed() {
    init_tracing();
    let doc = Document::parse(
        "https://example.com/",
        r#"<body><iframe src="/embedded"></iframe></body>"#,
    )
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let detector = ChangeDetector::start(
        doc.clone(),
        None,
        DetectorOptions::agent(),
        Arc::new(tx),
        Scheduler::new(),
    )
    .unwrap();
    let initial = next_update(&mut rx).await;
    assert!(!initial.html.contains("Inner"));

    let frame_doc = Document::parse(
        "https://example.com/embedded",
        "<body><button>Inner</button></body>",
    )
    .unwrap();
    let frame = doc.query_all("iframe").remove(0);
    frame.attach_frame_document(frame_doc.clone()).unwrap();

    let loaded = next_update(&mut rx).await;
    assert!(loaded.html.contains("Inner"));
    // The placeholder marker is not on the agent allow-list.
    assert!(loaded.html.contains("<div><button"));

    // Mutations inside the frame document reach the detector too.
    let inner_body = frame_doc.body().unwrap();
    let link = frame_doc.create_element("a");
    link.append_child(&frame_doc.create_text_node("Deeper"))
        .unwrap();
    inner_body.append_child(&link).unwrap();
    let changed = next_update(&mut rx).await;
    assert!(changed.html.contains("Deeper"));

    detector.stop();
}

#[tokio::test]
async fn session_follows_the_detector() {
    init_tracing();
    let doc = Document::parse(
        "https://example.com/",
        r#"<body><select name="size"><option>S</option><option>M</option></select></body>"#,
    )
    .unwrap();
    let session = AgentSession::new();
    let detector = ChangeDetector::start(
        doc.clone(),
        None,
        DetectorOptions::agent(),
        Arc::new(session.clone()),
        Scheduler::new(),
    )
    .unwrap();

    let html = session.section("html").unwrap();
    assert_eq!(html, detector.html());
    let select_tool = session
        .tools()
        .names()
        .find(|name| name.starts_with("select_"))
        .map(str::to_string)
        .unwrap();

    let config = session.session_config();
    assert_eq!(config["tool_choice"], "auto");
    assert!(config["instructions"].as_str().unwrap().starts_with("html: "));

    let output = session.invoke(&select_tool, json!({ "value": "M" })).await;
    assert!(output.is_success());
    let select = doc.query_all("select").remove(0);
    assert_eq!(select.value().as_deref(), Some("M"));

    detector.stop();
}

fn item_id(html: &str, item: &str) -> Option<String> {
    let at = html.find(&format!("\">{item}</button>"))?;
    html.get(at.checked_sub(12)?..at).map(str::to_string)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refreshes_publish_in_order() {
    init_tracing();
    let doc = Document::parse(
        "https://example.com/",
        r#"<body><div id="list"></div></body>"#,
    )
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let detector = ChangeDetector::start(
        doc.clone(),
        None,
        DetectorOptions::agent(),
        Arc::new(tx),
        Scheduler::new(),
    )
    .unwrap();
    assert_eq!(next_update(&mut rx).await.sequence, 0);

    let list = doc.element_by_id("list").unwrap();
    let items = 32;
    let tasks: Vec<_> = (0..items)
        .map(|i| {
            let doc = doc.clone();
            let list = list.clone();
            let detector = detector.clone();
            tokio::spawn(async move {
                let button = doc.create_element("button");
                button
                    .append_child(&doc.create_text_node(&format!("item-{i}")))
                    .unwrap();
                list.append_child(&button).unwrap();
                detector.refresh();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    // Later passes see the finished tree and publish nothing new.
    detector.refresh();

    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    assert!(!updates.is_empty());

    let mut seen = std::collections::HashMap::new();
    let mut shown = 0;
    for (n, update) in updates.iter().enumerate() {
        assert_eq!(update.sequence, n as u64 + 1);
        let count = update.html.matches("<button").count();
        assert!(count >= shown, "published {count} items after {shown}");
        shown = count;
        for i in 0..items {
            let item = format!("item-{i}");
            if let Some(id) = item_id(&update.html, &item) {
                assert_eq!(*seen.entry(item).or_insert_with(|| id.clone()), id);
            }
        }
    }

    let last = updates.last().unwrap();
    assert_eq!(shown, items);
    assert_eq!(last.html, detector.html());
    assert_eq!(last.sequence, detector.sequence());
    detector.stop();
}
