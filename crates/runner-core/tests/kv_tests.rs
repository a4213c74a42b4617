use runner_core::kvcache::PagedKVCache;

#[test]
fn plan_reuses_pages_across_requests_sharing_a_prefix() {
    let mut kv = PagedKVCache::with_capacity(8, 4);
    let shared: Vec<i64> = (0..8).collect();

    let mut a = shared.clone();
    a.extend([100, 101]);
    let mut b = shared.clone();
    b.extend([200, 201, 202]);

    let ma = kv.match_batch(&[a.clone()]).remove(0);
    kv.plan(vec![ma], &[a.clone()]).unwrap();
    let used_after_a = kv.page_table().n_used_pages();

    let mb = kv.match_batch(&[b.clone()]).remove(0);
    assert_eq!(mb.matched_len, 2, "full shared pages should match before planning b");
    kv.plan(vec![mb], &[b]).unwrap();

    // b only needs one new page (its own tail), not two full fresh pages.
    assert_eq!(kv.page_table().n_used_pages(), used_after_a + 1);
}

#[test]
fn fork_shares_page_table_but_not_scratch_buffers() {
    let mut kv = PagedKVCache::with_capacity(8, 4);
    let seq: Vec<i64> = (0..4).collect();
    let m = kv.match_batch(&[seq.clone()]).remove(0);
    kv.plan(vec![m], &[seq]).unwrap();

    let forked = kv.fork();
    assert_eq!(forked.page_table().n_used_pages(), kv.page_table().n_used_pages());
    assert!(forked.buffers().page_indices.is_empty());
}
