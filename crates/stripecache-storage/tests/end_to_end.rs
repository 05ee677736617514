//! Whole-cache scenarios against sparse file spans

use std::collections::HashMap;
use stripecache_common::{SpanConfig, ToolConfig, VolumeConfig};
use stripecache_storage::dir::DIR_DEPTH;
use stripecache_storage::{
    Cache, CopyId, Device, DeviceOptions, ReadOnly, ReadWrite, STORE_BLOCK_SIZE, STRIPE_BLOCK_SIZE,
    StripeOutcome, StripeRef,
};
use tempfile::NamedTempFile;

const GIB: u64 = 1024 * 1024 * 1024;

fn sparse(size: u64) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(size).unwrap();
    file
}

fn config(files: &[&NamedTempFile], volumes: Vec<VolumeConfig>) -> ToolConfig {
    ToolConfig {
        spans: files.iter().map(|f| SpanConfig::new(f.path())).collect(),
        volumes,
        ..ToolConfig::default()
    }
}

#[test]
fn test_ten_gib_span_single_volume() {
    let file = sparse(10 * GIB);
    let cfg = config(&[&file], vec![VolumeConfig::percent(1, 100)]);

    let (mut cache, diags) = Cache::<ReadWrite>::load(cfg.clone(), DeviceOptions::default());
    assert!(diags.is_empty());
    assert_eq!(cache.total_capacity().count(), 79);
    let diags = cache.allocate_empty_spans();
    assert!(!diags.has_fatal(), "{diags}");

    let (mut ro, diags) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
    assert!(diags.is_empty());
    let header = ro.spans()[0].header().unwrap();
    assert_eq!(header.num_used, 1);
    assert_eq!(header.num_free, 0);
    assert_eq!(header.num_volumes, 1);

    let loaded = ro.load_meta(None).unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(matches!(loaded[0].outcome, StripeOutcome::Done(CopyId::A)));

    let stripe = ro.stripe(loaded[0].stripe).unwrap();
    assert_eq!(stripe.start(), 2 * STORE_BLOCK_SIZE);
    assert_eq!(stripe.len().count(), 1_310_718);
    let a = stripe.copy(CopyId::A);
    assert_eq!(a.head.unwrap().sync_serial, a.foot.unwrap().sync_serial);

    let g = stripe.geometry();
    assert_eq!(g.segments * g.buckets * DIR_DEPTH, 1_338_876);
    assert_eq!(g.entries(), 1_338_876);

    let volume = &ro.volumes()[&1];
    assert_eq!(volume.stripes, vec![StripeRef { span: 0, stripe: 0 }]);
}

#[test]
fn test_routed_writes_are_found_by_retrieve_and_scan() {
    let (a, b) = (sparse(3 * STRIPE_BLOCK_SIZE), sparse(3 * STRIPE_BLOCK_SIZE));
    let cfg = config(
        &[&a, &b],
        vec![VolumeConfig::percent(1, 50), VolumeConfig::percent(2, 50)],
    );
    let (mut cache, _) = Cache::<ReadWrite>::load(cfg.clone(), DeviceOptions::default());
    assert!(!cache.allocate_empty_spans().has_fatal());
    assert_eq!(cache.stripes().len(), 4);

    let urls: Vec<String> = (0..60).map(|i| format!("http://example.com/object/{i}")).collect();
    let mut per_stripe: HashMap<StripeRef, u64> = HashMap::new();
    for (i, url) in urls.iter().enumerate() {
        let (key, r) = cache.find(url).unwrap();
        let (dev, stripes) = cache.span_mut(r.span).unwrap().parts_mut();
        let body = vec![i as u8; 700 + i];
        stripes[r.stripe].write_doc(dev, &key, b"HTTP/1.1 200 OK", &body).unwrap();
        *per_stripe.entry(r).or_default() += 1;
    }
    let refs = cache.stripes().to_vec();
    assert!(!cache.sync_stripes(&refs).has_fatal());

    let (mut ro, _) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
    for (i, url) in urls.iter().enumerate() {
        let hit = ro.retrieve(url).unwrap();
        let fragment = hit.fragment.unwrap_or_else(|| panic!("{url} not found"));
        assert_eq!(fragment.header(), b"HTTP/1.1 200 OK");
        assert_eq!(fragment.data().len(), 700 + i);
        assert!(fragment.data().iter().all(|&b| b == i as u8));
    }

    let reports = ro.scan();
    assert_eq!(reports.len(), 4);
    for report in &reports {
        let want = per_stripe.get(&report.stripe_ref()).copied().unwrap_or(0);
        assert_eq!(report.error, None);
        assert_eq!(report.entries, want, "{}", report.name);
        assert_eq!(report.docs_ok, want, "{}", report.name);
        assert_eq!(report.docs_bad, 0);
    }
}

#[test]
fn test_interrupted_sync_falls_back_to_previous_copy() {
    let file = sparse(3 * STRIPE_BLOCK_SIZE);
    let cfg = config(&[&file], vec![VolumeConfig::percent(1, 100)]);
    let (mut cache, _) = Cache::<ReadWrite>::load(cfg.clone(), DeviceOptions::default());
    cache.allocate_empty_spans();

    let url = "https://example.com/style.css";
    let (key, r) = cache.find(url).unwrap();
    let (dev, stripes) = cache.span_mut(r.span).unwrap().parts_mut();
    stripes[r.stripe].write_doc(dev, &key, b"", b"body { }").unwrap();
    assert_eq!(stripes[r.stripe].sync_dir(dev).unwrap(), CopyId::B);
    let b_foot = stripes[r.stripe].copy(CopyId::B).foot_pos;

    let (mut ro, _) = Cache::<ReadOnly>::load(cfg.clone(), DeviceOptions::default());
    assert!(ro.retrieve(url).unwrap().fragment.is_some());
    drop(ro);

    // the sync died after copy B's header: its footer never landed
    let dev = Device::<ReadWrite>::open(file.path(), DeviceOptions::default()).unwrap();
    dev.write_at(b_foot, &vec![0u8; STORE_BLOCK_SIZE as usize]).unwrap();
    dev.sync().unwrap();

    let (mut ro, _) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
    let loaded = ro.load_meta(None).unwrap();
    assert!(matches!(loaded[0].outcome, StripeOutcome::Done(CopyId::A)));
    let stripe = ro.stripe(loaded[0].stripe).unwrap();
    assert!(!stripe.copy(CopyId::B).is_consistent());
    assert!(ro.retrieve(url).unwrap().fragment.is_none());
}

#[test]
fn test_simulation_matches_written_layout() {
    let (a, b, c) = (
        sparse(5 * STRIPE_BLOCK_SIZE),
        sparse(9 * STRIPE_BLOCK_SIZE),
        sparse(2 * STRIPE_BLOCK_SIZE),
    );
    let cfg = config(
        &[&a, &b, &c],
        vec![
            VolumeConfig::percent(1, 40),
            VolumeConfig::megabytes(2, 512),
            VolumeConfig::percent(3, 30),
        ],
    );

    let (mut sim, _) = Cache::<ReadOnly>::load(cfg.clone(), DeviceOptions::default());
    let (_, diags) = sim.fill_all_spans();
    assert!(!diags.has_fatal());
    let planned: Vec<_> = sim
        .spans()
        .iter()
        .map(|s| s.stripes().iter().map(|st| st.descriptor()).collect::<Vec<_>>())
        .collect();

    let (mut rw, _) = Cache::<ReadWrite>::load(cfg.clone(), DeviceOptions::default());
    assert!(!rw.allocate_empty_spans().has_fatal());

    let (ro, _) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
    let written: Vec<_> = ro
        .spans()
        .iter()
        .map(|s| s.stripes().iter().map(|st| st.descriptor()).collect::<Vec<_>>())
        .collect();
    assert_eq!(planned, written);

    for v in ro.volumes().values() {
        let target = ro
            .config()
            .volumes
            .iter()
            .find(|c| c.volume == v.idx)
            .unwrap()
            .resolve(ro.total_capacity());
        assert!(stripecache_storage::volume::credited(v.size) <= target);
    }
}
