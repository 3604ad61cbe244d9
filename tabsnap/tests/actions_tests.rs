use std::sync::{Arc, Mutex};

use serde_json::json;
use tabsnap::dom::Event;
use tabsnap::{
    build_catalog, ActionOptions, Document, IdentityMap, NodeRef, Scheduler, SnapshotEngine,
    SnapshotOptions,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

fn record_events(node: &NodeRef, types: &[&str]) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for event_type in types {
        let log = log.clone();
        node.add_event_listener(
            event_type,
            Arc::new(move |e: &Event| {
                let entry = match e.key() {
                    Some(key) => format!("{}:{}", e.event_type(), key),
                    None => e.event_type().to_string(),
                };
                log.lock().unwrap().push(entry);
            }),
        );
    }
    log
}

fn snapshot_ids(doc: &Document) -> IdentityMap {
    let engine = SnapshotEngine::new(SnapshotOptions::agent()).unwrap();
    engine
        .snapshot(&doc.body().unwrap(), &IdentityMap::new())
        .identities
}

#[tokio::test(start_paused = true)]
async fn select_action_offers_live_options_and_fires_events() {
    init_tracing();
    let doc = Document::parse(
        "https://shop.example/",
        r#"<body><select name="fruit"><option>apple</option><option>banana</option></select></body>"#,
    )
    .unwrap();
    let select = doc.query_all("select").remove(0);
    let ids = snapshot_ids(&doc);
    let id = ids.get_key(&select).unwrap().to_string();
    let catalog = build_catalog(&doc, &ids, &ActionOptions::default(), &Scheduler::new());

    let name = format!("select_{id}");
    let spec = &catalog.get(&name).expect("select action").spec;
    assert_eq!(
        spec.parameters["properties"]["value"]["enum"],
        json!(["apple", "banana"])
    );

    let events = record_events(&select, &["input", "change"]);
    let output = catalog.invoke(&name, json!({ "value": "banana" })).await;
    assert!(output.is_success(), "{:?}", output);
    assert_eq!(select.value().as_deref(), Some("banana"));
    assert_eq!(*events.lock().unwrap(), vec!["input", "change"]);

    let rejected = catalog.invoke(&name, json!({ "value": "cherry" })).await;
    assert!(!rejected.is_success());
    assert_eq!(select.value().as_deref(), Some("banana"));
}

#[tokio::test(start_paused = true)]
async fn fill_text_types_each_character() {
    init_tracing();
    let doc = Document::parse(
        "https://example.com/",
        r#"<body><input name="greeting" value="old"></body>"#,
    )
    .unwrap();
    let input = doc.query_all("input").remove(0);
    let ids = snapshot_ids(&doc);
    let id = ids.get_key(&input).unwrap().to_string();
    let catalog = build_catalog(&doc, &ids, &ActionOptions::default(), &Scheduler::new());

    let events = record_events(&input, &["keydown", "input", "keyup", "change"]);
    let output = catalog
        .invoke("fillText", json!({ "snap_id": id, "text": "Hi!" }))
        .await;
    assert!(output.is_success(), "{:?}", output);
    assert!(output.respond);
    assert!(input.value().unwrap().ends_with("Hi!"));
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "change",
            "keydown:H",
            "input",
            "keyup:H",
            "keydown:i",
            "input",
            "keyup:i",
            "keydown:!",
            "input",
            "keyup:!",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_keydown_skips_the_character() {
    let doc = Document::parse("https://example.com/", "<body><textarea></textarea></body>").unwrap();
    let area = doc.query_all("textarea").remove(0);
    area.add_event_listener(
        "keydown",
        Arc::new(|e: &Event| {
            if e.key() == Some("x") {
                e.prevent_default();
            }
        }),
    );
    let ids = snapshot_ids(&doc);
    let id = ids.get_key(&area).unwrap().to_string();
    let catalog = build_catalog(&doc, &ids, &ActionOptions::default(), &Scheduler::new());
    let output = catalog
        .invoke("fillText", json!({ "snap_id": id, "text": "axb" }))
        .await;
    assert!(output.is_success());
    assert_eq!(area.value().as_deref(), Some("ab"));
}

#[tokio::test(start_paused = true)]
async fn date_inputs_are_set_directly() {
    let doc = Document::parse("https://example.com/", r#"<body><input type="date"></body>"#)
        .unwrap();
    let input = doc.query_all("input").remove(0);
    let ids = snapshot_ids(&doc);
    let id = ids.get_key(&input).unwrap().to_string();
    let catalog = build_catalog(&doc, &ids, &ActionOptions::default(), &Scheduler::new());
    let events = record_events(&input, &["keydown", "change"]);
    catalog
        .invoke("fillText", json!({ "snap_id": id, "text": "2024-05-01" }))
        .await;
    assert_eq!(input.value().as_deref(), Some("2024-05-01"));
    assert_eq!(*events.lock().unwrap(), vec!["change"]);
}

#[tokio::test]
async fn click_and_unknown_ids() {
    let doc = Document::parse(
        "https://example.com/",
        r#"<body><input type="checkbox" name="agree"></body>"#,
    )
    .unwrap();
    let checkbox = doc.query_all("input").remove(0);
    let ids = snapshot_ids(&doc);
    let id = ids.get_key(&checkbox).unwrap().to_string();
    let options = ActionOptions {
        silent: true,
        ..ActionOptions::default()
    };
    let catalog = build_catalog(&doc, &ids, &options, &Scheduler::new());

    let output = catalog.invoke("click", json!({ "snap_id": id })).await;
    assert!(output.is_success());
    assert!(!output.respond);
    assert!(checkbox.checked());

    let missing = catalog
        .invoke("click", json!({ "snap_id": "000000000000" }))
        .await;
    assert_eq!(missing.output["success"], json!(false));
    assert!(missing.output["error"]
        .as_str()
        .unwrap()
        .starts_with("Element not found"));
    assert!(missing.respond);
}

#[tokio::test(start_paused = true)]
async fn navigation_waits_for_the_settle_delay() {
    let doc = Document::new("https://example.com/a").unwrap();
    doc.history().push("https://example.com/b");
    let catalog = build_catalog(
        &doc,
        &IdentityMap::new(),
        &ActionOptions::default(),
        &Scheduler::new(),
    );
    let started = tokio::time::Instant::now();
    let output = catalog.invoke("navback", json!({})).await;
    assert!(output.is_success());
    assert!(started.elapsed() >= std::time::Duration::from_millis(1000));
    assert_eq!(doc.history().current(), "https://example.com/a");

    let output = catalog.invoke("navforward", json!({})).await;
    assert!(output.is_success());
    assert_eq!(doc.history().current(), "https://example.com/b");

    let no_nav = build_catalog(
        &doc,
        &IdentityMap::new(),
        &ActionOptions {
            disable_navigation: true,
            ..ActionOptions::default()
        },
        &Scheduler::new(),
    );
    assert!(!no_nav.contains("navback"));
    assert!(!no_nav.contains("navforward"));
}

#[tokio::test(start_paused = true)]
async fn stopping_the_scheduler_aborts_typing() {
    let doc = Document::parse("https://example.com/", "<body><input></body>").unwrap();
    let input = doc.query_all("input").remove(0);
    let ids = snapshot_ids(&doc);
    let id = ids.get_key(&input).unwrap().to_string();
    let scheduler = Scheduler::new();
    let catalog = build_catalog(&doc, &ids, &ActionOptions::default(), &scheduler);
    scheduler.stop();
    let output = catalog
        .invoke("fillText", json!({ "snap_id": id, "text": "never" }))
        .await;
    assert!(!output.is_success());
    assert_eq!(input.value().as_deref(), Some(""));
}
