//! Roundtrip and idempotence laws of the update interface.

use serde_json::json;
use weave_core::{
    diff_update_v1, diff_update_v2, encode_state_vector_from_update_v1, merge_updates_v1,
    merge_updates_v2, Doc, DocOptions,
};

fn doc_with_client(client_id: u32) -> Doc {
    Doc::with_options(DocOptions {
        client_id: Some(client_id),
        ..DocOptions::default()
    })
}

/// A document with edits from two clients, three transactions deep,
/// plus the per-transaction updates in commit order.
fn editing_history() -> (Doc, Vec<Vec<u8>>) {
    let mut a = doc_with_client(1);
    let arr = a.get_array("list").unwrap();
    let text = a.get_text("text").unwrap();
    let mut updates = Vec::new();

    let sv = a.encode_state_vector();
    a.transact(|txn| {
        arr.insert(txn, 0, [1i64, 2, 3])?;
        text.insert(txn, 0, "hello")
    })
    .unwrap();
    updates.push(a.encode_state_as_update_v1(Some(&sv)).unwrap());

    let sv = a.encode_state_vector();
    a.transact(|txn| {
        arr.delete(txn, 1, 1)?;
        text.insert(txn, 5, " world")
    })
    .unwrap();
    updates.push(a.encode_state_as_update_v1(Some(&sv)).unwrap());

    // A second author continues from the same history.
    let mut b = doc_with_client(2);
    b.apply_update_v1(&a.encode_state_as_update_v1(None).unwrap(), None)
        .unwrap();
    let arr_b = b.get_array("list").unwrap();
    let sv = b.encode_state_vector();
    b.transact(|txn| arr_b.insert(txn, 1, ["mid"])).unwrap();
    updates.push(b.encode_state_as_update_v1(Some(&sv)).unwrap());
    a.apply_update_v1(updates.last().unwrap(), None).unwrap();

    (a, updates)
}

fn fresh_with(updates: &[&[u8]]) -> Doc {
    let mut doc = doc_with_client(99);
    for update in updates {
        doc.apply_update_v1(update, None).unwrap();
    }
    doc
}

#[test]
fn self_encoding_reproduces_the_document() {
    let (doc, _) = editing_history();
    let full = doc.encode_state_as_update_v1(None).unwrap();
    let mut copy = doc_with_client(50);
    copy.apply_update_v1(&full, None).unwrap();
    assert_eq!(copy.to_json(), doc.to_json());
    assert_eq!(copy.state_vector(), doc.state_vector());
}

#[test]
fn v2_encoding_reproduces_the_document() {
    let (doc, _) = editing_history();
    let full = doc.encode_state_as_update_v2(None).unwrap();
    let mut copy = doc_with_client(50);
    copy.apply_update_v2(&full, None).unwrap();
    assert_eq!(copy.to_json(), doc.to_json());
}

#[test]
fn updates_apply_in_any_order() {
    let (doc, updates) = editing_history();
    let expected = doc.to_json();
    let orders: [[usize; 3]; 4] = [[0, 1, 2], [2, 1, 0], [1, 2, 0], [2, 0, 1]];
    for order in orders {
        let picked: Vec<&[u8]> = order.iter().map(|&i| updates[i].as_slice()).collect();
        let replayed = fresh_with(&picked);
        assert_eq!(replayed.to_json(), expected, "order {order:?}");
        assert!(!replayed.has_pending_structs(), "order {order:?}");
    }
}

#[test]
fn applying_an_update_twice_is_idempotent() {
    let (doc, updates) = editing_history();
    let mut copy = doc_with_client(50);
    for update in &updates {
        copy.apply_update_v1(update, None).unwrap();
        copy.apply_update_v1(update, None).unwrap();
    }
    assert_eq!(copy.to_json(), doc.to_json());
}

#[test]
fn merged_updates_equal_sequential_application() {
    let (doc, updates) = editing_history();
    let merged = merge_updates_v1(&updates).unwrap();
    let replayed = fresh_with(&[&merged]);
    assert_eq!(replayed.to_json(), doc.to_json());
    assert!(!replayed.has_pending_structs());
}

#[test]
fn merge_is_insensitive_to_argument_order() {
    let (doc, updates) = editing_history();
    let ab = merge_updates_v1(&[updates[0].clone(), updates[1].clone(), updates[2].clone()])
        .unwrap();
    let ba = merge_updates_v1(&[updates[2].clone(), updates[0].clone(), updates[1].clone()])
        .unwrap();
    assert_eq!(fresh_with(&[&ab]).to_json(), doc.to_json());
    assert_eq!(fresh_with(&[&ba]).to_json(), doc.to_json());
}

#[test]
fn merge_tolerates_overlapping_slices() {
    let (doc, updates) = editing_history();
    let full = doc.encode_state_as_update_v1(None).unwrap();
    // The full history overlaps every incremental slice.
    let merged =
        merge_updates_v1(&[updates[0].clone(), full.clone(), updates[2].clone()]).unwrap();
    assert_eq!(fresh_with(&[&merged]).to_json(), doc.to_json());
}

#[test]
fn merge_updates_v2_equal_sequential_application() {
    let mut doc = doc_with_client(3);
    let text = doc.get_text("t").unwrap();
    let sv = doc.encode_state_vector();
    doc.transact(|txn| text.insert(txn, 0, "ab")).unwrap();
    let u1 = doc.encode_state_as_update_v2(Some(&sv)).unwrap();
    let sv = doc.encode_state_vector();
    doc.transact(|txn| text.insert(txn, 1, "c")).unwrap();
    let u2 = doc.encode_state_as_update_v2(Some(&sv)).unwrap();

    let merged = merge_updates_v2(&[u1, u2]).unwrap();
    let mut copy = doc_with_client(50);
    copy.apply_update_v2(&merged, None).unwrap();
    assert_eq!(copy.to_json(), doc.to_json());
}

#[test]
fn diff_update_carries_exactly_the_missing_suffix() {
    let (doc, _) = editing_history();
    let full = doc.encode_state_as_update_v1(None).unwrap();

    // A peer that saw only the first slice of client 1's history.
    let mut early = doc_with_client(1);
    let e_arr = early.get_array("list").unwrap();
    early
        .transact(|txn| e_arr.insert(txn, 0, [1i64, 2, 3]))
        .unwrap();
    let prefix = early.encode_state_as_update_v1(None).unwrap();
    let mut partial = doc_with_client(60);
    partial.apply_update_v1(&prefix, None).unwrap();

    let diff = diff_update_v1(&full, &partial.encode_state_vector()).unwrap();
    assert!(diff.len() < full.len());
    partial.apply_update_v1(&diff, None).unwrap();
    assert_eq!(partial.to_json()["text"], doc.to_json()["text"]);
}

#[test]
fn diff_update_v2_roundtrips() {
    let (doc, _) = editing_history();
    let full = doc.encode_state_as_update_v2(None).unwrap();
    let empty_sv = doc_with_client(61).encode_state_vector();
    let diff = diff_update_v2(&full, &empty_sv).unwrap();
    let mut copy = doc_with_client(62);
    copy.apply_update_v2(&diff, None).unwrap();
    assert_eq!(copy.to_json(), doc.to_json());
}

#[test]
fn state_vector_from_update_matches_the_source_doc() {
    let (doc, _) = editing_history();
    let full = doc.encode_state_as_update_v1(None).unwrap();
    let sv_bytes = encode_state_vector_from_update_v1(&full).unwrap();
    assert_eq!(sv_bytes, doc.encode_state_vector());
}

#[test]
fn diff_against_state_vector_from_update_is_empty_of_structs() {
    let (doc, _) = editing_history();
    let full = doc.encode_state_as_update_v1(None).unwrap();
    let sv_bytes = encode_state_vector_from_update_v1(&full).unwrap();
    let diff = diff_update_v1(&full, &sv_bytes).unwrap();
    // Applying the residue to a copy changes nothing.
    let mut copy = doc_with_client(70);
    copy.apply_update_v1(&full, None).unwrap();
    let before = copy.to_json();
    copy.apply_update_v1(&diff, None).unwrap();
    assert_eq!(copy.to_json(), before);
}

#[test]
fn pending_buffers_survive_merge_with_later_updates() {
    let mut source = doc_with_client(7);
    let text = source.get_text("t").unwrap();
    let mut updates = Vec::new();
    for chunk in ["aa", "bb", "cc"] {
        let sv = source.encode_state_vector();
        source.transact(|txn| text.push(txn, chunk)).unwrap();
        updates.push(source.encode_state_as_update_v1(Some(&sv)).unwrap());
    }

    let mut receiver = doc_with_client(8);
    receiver.apply_update_v1(&updates[2], None).unwrap();
    assert!(receiver.has_pending_structs());
    receiver.apply_update_v1(&updates[1], None).unwrap();
    assert!(receiver.has_pending_structs());
    receiver.apply_update_v1(&updates[0], None).unwrap();
    assert!(!receiver.has_pending_structs());
    assert_eq!(receiver.to_json(), source.to_json());
}

#[test]
fn state_vector_comparison_drives_incremental_sync() {
    let mut a = doc_with_client(1);
    let mut b = doc_with_client(2);
    let arr_a = a.get_array("l").unwrap();
    a.transact(|txn| arr_a.insert(txn, 0, [1i64])).unwrap();
    let step1 = a
        .encode_state_as_update_v1(Some(&b.encode_state_vector()))
        .unwrap();
    b.apply_update_v1(&step1, None).unwrap();

    a.transact(|txn| arr_a.insert(txn, 1, [2i64])).unwrap();
    let step2 = a
        .encode_state_as_update_v1(Some(&b.encode_state_vector()))
        .unwrap();
    assert!(step2.len() < a.encode_state_as_update_v1(None).unwrap().len());
    b.apply_update_v1(&step2, None).unwrap();
    assert_eq!(b.to_json(), json!({"l": [1, 2]}));
}
