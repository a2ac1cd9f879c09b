//! Seeded differential convergence: random concurrent editing
//! sessions across three peers, synchronized pairwise in random
//! order, must agree byte-for-byte on their views.

use serde_json::Value;
use weave_core::{Doc, DocOptions};

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        // Constants from Knuth's MMIX generator.
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.state
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound.max(1)
    }
}

fn seeds() -> [u64; 12] {
    [
        0x5eed_c0de_u64,
        0x0000_0000_0000_0001_u64,
        0x0000_0000_0000_00ff_u64,
        0x0000_0000_00c0_ffee_u64,
        0x0123_4567_89ab_cdef_u64,
        0x1111_2222_3333_4444_u64,
        0x4444_5555_6666_7777_u64,
        0x89ab_cdef_0123_4567_u64,
        0xfedc_ba98_7654_3210_u64,
        0x1357_9bdf_2468_ace0_u64,
        0x0f0f_f0f0_55aa_aa55_u64,
        0xa5a5_5a5a_dead_beef_u64,
    ]
}

fn doc_with_client(client_id: u32) -> Doc {
    Doc::with_options(DocOptions {
        client_id: Some(client_id),
        ..DocOptions::default()
    })
}

fn random_edit(rng: &mut Lcg, doc: &mut Doc, step: u64) {
    let choice = rng.below(4);
    match choice {
        0 => {
            let arr = doc.get_array("list").unwrap();
            doc.transact(|txn| {
                let len = arr.len(txn);
                let at = rng.below(len as u64 + 1) as u32;
                arr.insert(txn, at, [step as i64])
            })
            .unwrap();
        }
        1 => {
            let arr = doc.get_array("list").unwrap();
            doc.transact(|txn| {
                let len = arr.len(txn);
                if len > 0 {
                    let at = rng.below(len as u64) as u32;
                    arr.delete(txn, at, 1)?;
                }
                Ok(())
            })
            .unwrap();
        }
        2 => {
            let text = doc.get_text("text").unwrap();
            doc.transact(|txn| {
                let len = text.len(txn);
                let at = rng.below(len as u64 + 1) as u32;
                let chunk = format!("{}", step % 10);
                text.insert(txn, at, &chunk)
            })
            .unwrap();
        }
        _ => {
            let map = doc.get_map("map").unwrap();
            doc.transact(|txn| {
                let key = format!("k{}", rng.below(5));
                map.set(txn, &key, step as i64)
            })
            .unwrap();
        }
    }
}

fn sync_pair(a: &mut Doc, b: &mut Doc) {
    let from_a = a
        .encode_state_as_update_v1(Some(&b.encode_state_vector()))
        .expect("encode a");
    let from_b = b
        .encode_state_as_update_v1(Some(&a.encode_state_vector()))
        .expect("encode b");
    b.apply_update_v1(&from_a, None).expect("apply a->b");
    a.apply_update_v1(&from_b, None).expect("apply b->a");
}

fn view(doc: &mut Doc) -> Value {
    // Materialize every root first so views list the same containers.
    doc.get_array("list").unwrap();
    doc.get_text("text").unwrap();
    doc.get_map("map").unwrap();
    doc.to_json()
}

#[test]
fn three_peers_converge_after_random_edits_and_pairwise_sync() {
    for seed in seeds() {
        let mut rng = Lcg::new(seed);
        let mut docs = [doc_with_client(1), doc_with_client(2), doc_with_client(3)];

        for round in 0..6 {
            for (d, doc) in docs.iter_mut().enumerate() {
                let edits = 1 + rng.below(4);
                for e in 0..edits {
                    let step = round * 100 + (d as u64) * 10 + e;
                    random_edit(&mut rng, doc, step);
                }
            }
            // One random pair syncs; full convergence only at the end.
            let i = rng.below(3) as usize;
            let j = (i + 1 + rng.below(2) as usize) % 3;
            let (left, right) = if i < j {
                let (a, b) = docs.split_at_mut(j);
                (&mut a[i], &mut b[0])
            } else {
                let (a, b) = docs.split_at_mut(i);
                (&mut b[0], &mut a[j])
            };
            sync_pair(left, right);
        }

        // Final full mesh.
        for _ in 0..2 {
            let (a, rest) = docs.split_at_mut(1);
            sync_pair(&mut a[0], &mut rest[0]);
            let (b, c) = rest.split_at_mut(1);
            sync_pair(&mut b[0], &mut c[0]);
        }

        let v0 = view(&mut docs[0]);
        let v1 = view(&mut docs[1]);
        let v2 = view(&mut docs[2]);
        assert_eq!(v0, v1, "seed {seed:#x}");
        assert_eq!(v1, v2, "seed {seed:#x}");
        for doc in &docs {
            doc.validate().unwrap_or_else(|e| panic!("seed {seed:#x}: {e}"));
        }

        let sv0 = docs[0].encode_state_vector();
        assert_eq!(sv0, docs[1].encode_state_vector(), "seed {seed:#x}");
        assert_eq!(sv0, docs[2].encode_state_vector(), "seed {seed:#x}");
    }
}

#[test]
fn snapshot_exchange_is_equivalent_to_incremental_sync() {
    for seed in seeds() {
        let mut rng = Lcg::new(seed ^ 0x00ff_00ff);
        let mut a = doc_with_client(1);
        let mut b = doc_with_client(2);
        for step in 0..20 {
            random_edit(&mut rng, &mut a, step);
            if step % 3 == 0 {
                random_edit(&mut rng, &mut b, 1000 + step);
            }
            if step % 5 == 4 {
                sync_pair(&mut a, &mut b);
            }
        }

        // A third peer bootstrapped from one full snapshot of each.
        let mut c = doc_with_client(3);
        c.apply_update_v1(&a.encode_state_as_update_v1(None).unwrap(), None)
            .unwrap();
        c.apply_update_v1(&b.encode_state_as_update_v1(None).unwrap(), None)
            .unwrap();
        sync_pair(&mut a, &mut b);
        sync_pair(&mut a, &mut c);
        sync_pair(&mut b, &mut c);

        let va = view(&mut a);
        assert_eq!(va, view(&mut b), "seed {seed:#x}");
        assert_eq!(va, view(&mut c), "seed {seed:#x}");
        for doc in [&a, &b, &c] {
            doc.validate().unwrap_or_else(|e| panic!("seed {seed:#x}: {e}"));
        }
    }
}
