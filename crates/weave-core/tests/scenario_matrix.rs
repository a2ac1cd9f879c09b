//! End-to-end scenarios with literal inputs and pinned outcomes.

use serde_json::{json, Value};
use weave_core::{Doc, DocOptions, EngineError, In};

fn doc_with_client(client_id: u32) -> Doc {
    Doc::with_options(DocOptions {
        client_id: Some(client_id),
        ..DocOptions::default()
    })
}

fn sync_both_ways(a: &mut Doc, b: &mut Doc) {
    let from_a = a
        .encode_state_as_update_v1(Some(&b.encode_state_vector()))
        .expect("encode a");
    let from_b = b
        .encode_state_as_update_v1(Some(&a.encode_state_vector()))
        .expect("encode b");
    b.apply_update_v1(&from_a, None).expect("apply a->b");
    a.apply_update_v1(&from_b, None).expect("apply b->a");
    a.validate().expect("a invariants");
    b.validate().expect("b invariants");
}

#[test]
fn concurrent_head_inserts_converge_with_lower_client_first() {
    let mut a = doc_with_client(1);
    let mut b = doc_with_client(2);
    let arr_a = a.get_array("list").unwrap();
    let arr_b = b.get_array("list").unwrap();
    a.transact(|txn| arr_a.insert(txn, 0, [1i64])).unwrap();
    b.transact(|txn| arr_b.insert(txn, 0, [2i64])).unwrap();

    sync_both_ways(&mut a, &mut b);

    let view_a = a.transact(|txn| Ok(arr_a.to_vec(txn))).unwrap();
    let view_b = b.transact(|txn| Ok(arr_b.to_vec(txn))).unwrap();
    assert_eq!(view_a, view_b);
    // Tie on equal origins resolves by client id.
    assert_eq!(view_a, vec![json!(1), json!(2)]);
}

#[test]
fn interleaved_text_edits_converge() {
    let mut a = doc_with_client(1);
    let text_a = a.get_text("t").unwrap();
    a.transact(|txn| text_a.insert(txn, 0, "abc")).unwrap();

    let mut b = doc_with_client(2);
    let base = a.encode_state_as_update_v1(None).unwrap();
    b.apply_update_v1(&base, None).unwrap();
    let text_b = b.get_text("t").unwrap();

    a.transact(|txn| {
        text_a.remove_range(txn, 1, 1)?;
        text_a.insert(txn, 1, "X")
    })
    .unwrap();
    b.transact(|txn| text_b.insert(txn, 2, "Y")).unwrap();

    sync_both_ways(&mut a, &mut b);

    let s_a = a.transact(|txn| Ok(text_a.get_string(txn))).unwrap();
    let s_b = b.transact(|txn| Ok(text_b.get_string(txn))).unwrap();
    assert_eq!(s_a, s_b);
    assert_eq!(s_a.len(), 4);
    assert!(s_a.starts_with('a'));
    assert!(s_a.ends_with('c'));
    assert!(s_a.contains('X'));
    assert!(s_a.contains('Y'));
}

#[test]
fn concurrent_map_writes_resolve_to_higher_client() {
    let mut a = doc_with_client(1);
    let mut b = doc_with_client(2);
    let map_a = a.get_map("m").unwrap();
    let map_b = b.get_map("m").unwrap();
    a.transact(|txn| map_a.set(txn, "k", "1")).unwrap();
    b.transact(|txn| map_b.set(txn, "k", "2")).unwrap();

    sync_both_ways(&mut a, &mut b);

    let v_a = a.transact(|txn| Ok(map_a.get(txn, "k"))).unwrap();
    let v_b = b.transact(|txn| Ok(map_b.get(txn, "k"))).unwrap();
    assert_eq!(v_a, v_b);
    assert_eq!(v_a, Some(json!("2")));
}

#[test]
fn out_of_order_updates_buffer_until_causality_arrives() {
    let mut source = doc_with_client(7);
    let arr = source.get_array("list").unwrap();

    let mut updates: Vec<Vec<u8>> = Vec::new();
    {
        let sv0 = source.encode_state_vector();
        source
            .transact(|txn| arr.insert(txn, 0, [1i64, 2, 3, 4]))
            .unwrap();
        updates.push(source.encode_state_as_update_v1(Some(&sv0)).unwrap());
    }
    {
        let sv1 = source.encode_state_vector();
        source.transact(|txn| arr.insert(txn, 1, [9i64])).unwrap();
        updates.push(source.encode_state_as_update_v1(Some(&sv1)).unwrap());
    }

    let mut receiver = doc_with_client(11);
    // The second transaction first: clocks 0..4 are missing.
    receiver.apply_update_v1(&updates[1], None).unwrap();
    assert!(receiver.has_pending_structs());
    let missing = receiver.pending_missing().unwrap();
    assert!(missing.contains_key(&7));
    assert!(missing[&7] < 4);
    // Nothing integrated yet; the buffered structs are invisible.
    assert_eq!(receiver.to_json(), json!({}));

    receiver.apply_update_v1(&updates[0], None).unwrap();
    assert!(!receiver.has_pending_structs());

    let mut forward = doc_with_client(12);
    forward.apply_update_v1(&updates[0], None).unwrap();
    forward.apply_update_v1(&updates[1], None).unwrap();
    assert_eq!(receiver.to_json(), forward.to_json());
    assert_eq!(receiver.to_json()["list"], json!([1, 9, 2, 3, 4]));
}

#[test]
fn tombstones_collapse_and_shrink_the_encoding() {
    let run = |gc: bool| -> (Value, u32, usize) {
        let mut doc = Doc::with_options(DocOptions {
            client_id: Some(1),
            gc,
            ..DocOptions::default()
        });
        let arr = doc.get_array("list").unwrap();
        let values: Vec<i64> = (0..100).collect();
        doc.transact(|txn| arr.insert(txn, 0, values.clone()))
            .unwrap();
        doc.transact(|txn| arr.delete(txn, 10, 41)).unwrap();
        let len = doc.transact(|txn| Ok(arr.len(txn))).unwrap();
        let update = doc.encode_state_as_update_v1(None).unwrap();
        (doc.to_json(), len, update.len())
    };

    let (view_gc, len_gc, bytes_gc) = run(true);
    let (view_keep, len_keep, bytes_keep) = run(false);
    assert_eq!(len_gc, 59);
    assert_eq!(len_keep, 59);
    assert_eq!(view_gc, view_keep);
    assert!(
        bytes_gc < bytes_keep,
        "collapsed tombstones must encode smaller: {bytes_gc} vs {bytes_keep}"
    );

    // A fresh peer reconstructs the same view from the collapsed
    // encoding.
    let mut doc = Doc::with_options(DocOptions {
        client_id: Some(1),
        ..DocOptions::default()
    });
    let arr = doc.get_array("list").unwrap();
    let values: Vec<i64> = (0..100).collect();
    doc.transact(|txn| arr.insert(txn, 0, values)).unwrap();
    doc.transact(|txn| arr.delete(txn, 10, 41)).unwrap();
    let update = doc.encode_state_as_update_v1(None).unwrap();
    let mut peer = doc_with_client(2);
    peer.apply_update_v1(&update, None).unwrap();
    assert_eq!(peer.to_json(), doc.to_json());
}

#[test]
fn mid_item_insert_splits_and_roundtrips() {
    let mut doc = doc_with_client(1);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "0123456789"))
        .unwrap();
    doc.transact(|txn| text.insert(txn, 4, "X")).unwrap();

    let s = doc.transact(|txn| Ok(text.get_string(txn))).unwrap();
    assert_eq!(s, "0123X456789");
    assert_eq!(doc.state_vector().get(1), 11);

    let update = doc.encode_state_as_update_v1(None).unwrap();
    let mut peer = doc_with_client(2);
    peer.apply_update_v1(&update, None).unwrap();
    let text_peer = peer.get_text("t").unwrap();
    let s_peer = peer.transact(|txn| Ok(text_peer.get_string(txn))).unwrap();
    assert_eq!(s_peer, "0123X456789");
    assert_eq!(peer.state_vector().get(1), 11);
}

#[test]
fn utf16_indexing_counts_surrogate_pairs() {
    let mut doc = doc_with_client(1);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "a𝄞b")).unwrap();
    let len = doc.transact(|txn| Ok(text.len(txn))).unwrap();
    assert_eq!(len, 4);
    // Split after the astral pair.
    doc.transact(|txn| text.insert(txn, 3, "-")).unwrap();
    let s = doc.transact(|txn| Ok(text.get_string(txn))).unwrap();
    assert_eq!(s, "a𝄞-b");
}

#[test]
fn length_exceeded_is_surfaced_and_the_doc_survives() {
    let mut doc = doc_with_client(1);
    let arr = doc.get_array("list").unwrap();
    doc.transact(|txn| arr.insert(txn, 0, [1i64])).unwrap();
    let err = doc.transact(|txn| arr.insert(txn, 5, [2i64])).unwrap_err();
    assert!(matches!(err, EngineError::LengthExceeded { index: 5, len: 1 }));
    // The failed transaction still closed; the doc keeps working.
    doc.transact(|txn| arr.insert(txn, 1, [3i64])).unwrap();
    assert_eq!(doc.to_json()["list"], json!([1, 3]));
}

#[test]
fn root_kind_mismatch_is_rejected_but_abstract_roots_retype() {
    let mut a = doc_with_client(1);
    let arr = a.get_array("data").unwrap();
    a.transact(|txn| arr.insert(txn, 0, [1i64])).unwrap();
    assert!(matches!(
        a.get_map("data"),
        Err(EngineError::TypeMismatch { .. })
    ));

    // A peer that never fetched the root still decodes it (as an
    // abstract container) and can specialize it afterwards.
    let update = a.encode_state_as_update_v1(None).unwrap();
    let mut b = doc_with_client(2);
    b.apply_update_v1(&update, None).unwrap();
    let arr_b = b.get_array("data").unwrap();
    let view = b.transact(|txn| Ok(arr_b.to_vec(txn))).unwrap();
    assert_eq!(view, vec![json!(1)]);
}

#[test]
fn nested_containers_roundtrip() {
    let mut doc = doc_with_client(1);
    let map = doc.get_map("root").unwrap();
    doc.transact(|txn| {
        map.set(txn, "todo", In::Array(vec![In::from("milk"), In::from("bread")]))?;
        map.set(
            txn,
            "profile",
            In::Map(vec![("name".to_string(), In::from("ada"))]),
        )?;
        map.set(txn, "notes", In::Text("hi".to_string()))
    })
    .unwrap();

    let expected = json!({
        "root": {
            "todo": ["milk", "bread"],
            "profile": {"name": "ada"},
            "notes": "hi",
        }
    });
    assert_eq!(doc.to_json(), expected);

    let update = doc.encode_state_as_update_v1(None).unwrap();
    let mut peer = doc_with_client(2);
    peer.apply_update_v1(&update, None).unwrap();
    peer.get_map("root").unwrap();
    assert_eq!(peer.to_json(), expected);
}

#[test]
fn deleting_a_nested_container_tombstones_its_content() {
    let mut doc = doc_with_client(1);
    let map = doc.get_map("root").unwrap();
    doc.transact(|txn| {
        map.set(txn, "inner", In::Array(vec![In::from(1i64), In::from(2i64)]))
    })
    .unwrap();
    doc.transact(|txn| {
        map.delete(txn, "inner");
        Ok(())
    })
    .unwrap();
    assert_eq!(doc.to_json()["root"], json!({}));

    let update = doc.encode_state_as_update_v1(None).unwrap();
    let mut peer = doc_with_client(2);
    peer.apply_update_v1(&update, None).unwrap();
    peer.get_map("root").unwrap();
    assert_eq!(peer.to_json()["root"], json!({}));
}

#[test]
fn xml_element_attributes_and_children() {
    let mut doc = doc_with_client(1);
    let el = doc.get_xml_element("node").unwrap();
    doc.transact(|txn| {
        el.insert_attribute(txn, "class", "title")?;
        el.insert(txn, 0, [In::XmlText("hello".to_string())])
    })
    .unwrap();
    let (tag, attrs, children) = doc
        .transact(|txn| Ok((el.tag(txn), el.attributes(txn), el.children(txn))))
        .unwrap();
    assert_eq!(tag, "node");
    assert_eq!(attrs, vec![("class".to_string(), "title".to_string())]);
    assert_eq!(children, vec![json!("hello")]);

    let update = doc.encode_state_as_update_v1(None).unwrap();
    let mut peer = doc_with_client(2);
    peer.apply_update_v1(&update, None).unwrap();
    let el_b = peer.get_xml_element("node").unwrap();
    let attrs_b = peer.transact(|txn| Ok(el_b.attributes(txn))).unwrap();
    assert_eq!(attrs_b, vec![("class".to_string(), "title".to_string())]);
}
