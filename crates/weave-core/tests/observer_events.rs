//! Observer dispatch: change summaries, deep bubbling, doc events.

use std::sync::{Arc, Mutex};

use serde_json::json;
use weave_core::{
    ContainerEvent, DeltaOp, Doc, DocOptions, EntryChange, In, PathSegment, SubdocsEvent,
};

fn doc_with_client(client_id: u32) -> Doc {
    Doc::with_options(DocOptions {
        client_id: Some(client_id),
        ..DocOptions::default()
    })
}

#[test]
fn sequence_observer_receives_insert_and_delete_delta() {
    let mut doc = doc_with_client(1);
    let arr = doc.get_array("list").unwrap();
    let seen: Arc<Mutex<Vec<ContainerEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    doc.observe(arr, move |event| sink.lock().unwrap().push(event.clone()));

    doc.transact(|txn| arr.insert(txn, 0, [1i64, 2, 3])).unwrap();
    doc.transact(|txn| arr.delete(txn, 1, 1)).unwrap();

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0].delta,
        vec![DeltaOp::Insert(vec![json!(1), json!(2), json!(3)])]
    );
    assert_eq!(events[1].delta, vec![DeltaOp::Retain(1), DeltaOp::Delete(1)]);
    assert!(events[0].local);
    assert_eq!(events[0].root, "list");
    assert!(events[0].path.is_empty());
}

#[test]
fn map_observer_reports_add_update_delete() {
    let mut doc = doc_with_client(1);
    let map = doc.get_map("m").unwrap();
    let seen: Arc<Mutex<Vec<ContainerEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    doc.observe(map, move |event| sink.lock().unwrap().push(event.clone()));

    doc.transact(|txn| map.set(txn, "k", "first")).unwrap();
    doc.transact(|txn| map.set(txn, "k", "second")).unwrap();
    doc.transact(|txn| {
        map.delete(txn, "k");
        Ok(())
    })
    .unwrap();

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 3);

    let add = &events[0].keys["k"];
    assert_eq!(add.action, EntryChange::Add);
    assert_eq!(add.old_value, None);
    assert_eq!(add.new_value, Some(json!("first")));

    let update = &events[1].keys["k"];
    assert_eq!(update.action, EntryChange::Update);
    assert_eq!(update.old_value, Some(json!("first")));
    assert_eq!(update.new_value, Some(json!("second")));

    let delete = &events[2].keys["k"];
    assert_eq!(delete.action, EntryChange::Delete);
    assert_eq!(delete.old_value, Some(json!("second")));
    assert_eq!(delete.new_value, None);
}

#[test]
fn deep_observer_sees_nested_changes_with_paths() {
    let mut doc = doc_with_client(1);
    let root = doc.get_map("root").unwrap();
    doc.transact(|txn| root.set(txn, "inner", In::Array(vec![])))
        .unwrap();
    let inner = doc
        .transact(|txn| Ok(root.get_container(txn, "inner")))
        .unwrap()
        .expect("nested array");

    let seen: Arc<Mutex<Vec<Vec<ContainerEvent>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    doc.observe_deep(root, move |events| {
        sink.lock().unwrap().push(events.to_vec())
    });

    doc.transact(|txn| {
        let inner = weave_core::ArrayRef::from_ref(txn, inner).expect("array kind");
        inner.insert(txn, 0, ["x"])
    })
    .unwrap();

    let batches = seen.lock().unwrap();
    assert_eq!(batches.len(), 1);
    let events = &batches[0];
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].root, "root");
    assert_eq!(events[0].path, vec![PathSegment::Key("inner".to_string())]);
    assert_eq!(events[0].delta, vec![DeltaOp::Insert(vec![json!("x")])]);
}

#[test]
fn remote_transactions_are_flagged_non_local() {
    let mut a = doc_with_client(1);
    let arr = a.get_array("list").unwrap();
    a.transact(|txn| arr.insert(txn, 0, [1i64])).unwrap();
    let update = a.encode_state_as_update_v1(None).unwrap();

    let mut b = doc_with_client(2);
    let arr_b = b.get_array("list").unwrap();
    let seen: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    b.observe(arr_b, move |event| sink.lock().unwrap().push(event.local));
    b.apply_update_v1(&update, Some(json!("relay"))).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![false]);
}

#[test]
fn update_event_bytes_reproduce_the_transaction() {
    let mut a = doc_with_client(1);
    let arr = a.get_array("list").unwrap();
    let captured: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    a.on_update(move |event| sink.lock().unwrap().push(event.update.clone()));

    a.transact(|txn| arr.insert(txn, 0, [1i64, 2])).unwrap();
    a.transact(|txn| arr.delete(txn, 0, 1)).unwrap();

    let updates = captured.lock().unwrap();
    assert_eq!(updates.len(), 2);
    let mut b = doc_with_client(2);
    for update in updates.iter() {
        b.apply_update_v1(update, None).unwrap();
    }
    assert_eq!(b.to_json(), a.to_json());
}

#[test]
fn read_only_transactions_emit_no_update() {
    let mut doc = doc_with_client(1);
    let arr = doc.get_array("list").unwrap();
    doc.transact(|txn| arr.insert(txn, 0, [1i64])).unwrap();
    let count: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
    let sink = count.clone();
    doc.on_update(move |_| *sink.lock().unwrap() += 1);

    doc.transact(|txn| Ok(arr.len(txn))).unwrap();
    assert_eq!(*count.lock().unwrap(), 0);

    doc.transact(|txn| arr.insert(txn, 0, [2i64])).unwrap();
    assert_eq!(*count.lock().unwrap(), 1);
}

#[test]
fn transaction_lifecycle_events_fire_in_order() {
    let mut doc = doc_with_client(1);
    let arr = doc.get_array("list").unwrap();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    doc.on_before_transaction(move |_| l.lock().unwrap().push("before"));
    let l = log.clone();
    doc.on_before_observer_calls(move |_| l.lock().unwrap().push("observer-calls"));
    let l = log.clone();
    doc.on_after_transaction(move |_| l.lock().unwrap().push("after"));
    let l = log.clone();
    doc.on_after_transaction_cleanup(move |_| l.lock().unwrap().push("cleanup"));

    doc.transact(|txn| arr.insert(txn, 0, [1i64])).unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["before", "observer-calls", "after", "cleanup"]
    );
}

#[test]
fn unsubscribe_stops_delivery() {
    let mut doc = doc_with_client(1);
    let arr = doc.get_array("list").unwrap();
    let count: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
    let sink = count.clone();
    let sub = doc.observe(arr, move |_| *sink.lock().unwrap() += 1);

    doc.transact(|txn| arr.insert(txn, 0, [1i64])).unwrap();
    assert!(doc.unsubscribe(sub));
    doc.transact(|txn| arr.insert(txn, 0, [2i64])).unwrap();
    assert_eq!(*count.lock().unwrap(), 1);
    assert!(!doc.unsubscribe(sub));
}

#[test]
fn subdoc_insertion_surfaces_in_the_subdocs_event() {
    let mut doc = doc_with_client(1);
    let map = doc.get_map("m").unwrap();
    let seen: Arc<Mutex<Vec<SubdocsEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    doc.on_subdocs(move |event| sink.lock().unwrap().push(event.clone()));

    let sub = Doc::with_options(DocOptions {
        guid: Some("sub-1".to_string()),
        ..DocOptions::default()
    });
    doc.transact(|txn| map.set(txn, "child", In::Doc(Box::new(sub))))
        .unwrap();

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].added, vec!["sub-1".to_string()]);
    assert!(doc.subdocs().contains("sub-1"));
    drop(events);

    doc.transact(|txn| {
        map.delete(txn, "child");
        Ok(())
    })
    .unwrap();
    let events = seen.lock().unwrap();
    assert_eq!(events[1].removed, vec!["sub-1".to_string()]);
    assert!(!doc.subdocs().contains("sub-1"));
}
