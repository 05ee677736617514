//! Command output
//!
//! Each command prints its report to stdout and returns the findings that
//! decide the exit status.

use anyhow::Result;
use std::path::Path;
use stripecache_common::{Diagnostics, StripeBlocks};
use stripecache_storage::{
    Access, Cache, CopyId, StripeMeta, StripeOutcome, StripeRef, StripeResult, VolumeAllocator,
    volume::credited,
};

fn serial(meta: Option<&StripeMeta>) -> String {
    meta.map_or_else(|| "-".to_owned(), |m| m.sync_serial.to_string())
}

/// Fold per-stripe failures into diagnostics, returning the successes
fn outcomes<T>(results: Vec<StripeResult<T>>, diags: &mut Diagnostics) -> Vec<(StripeRef, String, T)> {
    let mut done = Vec::with_capacity(results.len());
    for r in results {
        match r.outcome {
            StripeOutcome::Done(v) => done.push((r.stripe, r.name, v)),
            StripeOutcome::Uninitialized => diags.warn(format!("stripe {} is not initialized", r.name)),
            StripeOutcome::Failed(e) => diags.fatal(format!("stripe {}: {e}", r.name)),
        }
    }
    done
}

pub fn list_spans<A: Access>(cache: &Cache<A>) {
    println!("Spans");
    println!("=====");
    for span in cache.spans() {
        let used = span.stripes().iter().filter(|s| !s.is_free()).count();
        println!(
            "{}: {} bytes, stripes at {}, {} stripes ({} in use), {} free, {}",
            span.path().display(),
            span.len().bytes(),
            span.offset(),
            span.stripes().len(),
            used,
            credited(span.free_space()),
            if span.is_initialized() { "initialized" } else { "uninitialized" },
        );
    }
    println!("Total capacity: {}", cache.total_capacity());
}

pub fn list_stripes<A: Access>(cache: &mut Cache<A>, device: Option<&Path>) -> Result<Diagnostics> {
    let results = cache.load_meta(device)?;
    let mut diags = Diagnostics::new();
    for r in &results {
        let Some(stripe) = cache.stripe(r.stripe) else {
            continue;
        };
        println!(
            "{} volume {} start {} length {} content {}",
            r.name,
            stripe.vol_idx(),
            stripe.start(),
            stripe.len().bytes(),
            stripe.content()
        );
        let g = stripe.geometry();
        println!("  directory: {} segments x {} buckets", g.segments, g.buckets);
        for copy in CopyId::ALL {
            let c = stripe.copy(copy);
            println!(
                "  {copy}: head @{} serial {} foot @{} serial {} {}",
                c.head_pos,
                serial(c.head.as_ref()),
                c.foot_pos,
                serial(c.foot.as_ref()),
                if c.is_consistent() { "consistent" } else { "inconsistent" },
            );
        }
        match &r.outcome {
            StripeOutcome::Done(copy) => println!("  active: {copy}"),
            StripeOutcome::Uninitialized => println!("  active: none (uninitialized)"),
            StripeOutcome::Failed(e) => println!("  active: none ({e})"),
        }
    }
    outcomes(results, &mut diags);
    Ok(diags)
}

pub fn list_volumes<A: Access>(cache: &Cache<A>) {
    let mut alloc = VolumeAllocator::new(&cache.config().volumes, cache.total_capacity());
    alloc.load_sizes(cache.volumes());

    println!("Volumes");
    println!("=======");
    for t in alloc.targets() {
        println!("volume {}: target {} allocated {}", t.config.volume, t.alloc, t.size);
    }
    for v in cache.volumes().values() {
        println!("volume {}: {} stripes, {} bytes", v.idx, v.stripes.len(), v.size.bytes());
        for r in &v.stripes {
            if let Some(s) = cache.stripe(*r) {
                println!("  {}", s.hash_text());
            }
        }
    }
}

pub fn dir_check<A: Access>(cache: &mut Cache<A>, device: Option<&Path>) -> Result<Diagnostics> {
    let mut diags = Diagnostics::new();
    for (_, name, report) in outcomes(cache.dir_check(device)?, &mut diags) {
        println!("{name}");
        println!(
            "  entries: {} in use, {} stale, {} free, {} empty",
            report.in_use, report.stale, report.free, report.empty
        );
        println!(
            "  buckets: {} in use, chain avg {:.2} max {}",
            report.buckets_in_use,
            report.avg_chain(),
            report.max_chain
        );
        println!(
            "  objects: {}, {} bytes, average size {}, {:.2} fragments each",
            report.objects,
            report.bytes_in_use,
            report.average_object_size(),
            report.average_fragments()
        );
        let histogram: Vec<String> = report.chain_histogram.iter().map(u64::to_string).collect();
        println!("  chain lengths: {}", histogram.join(" "));
        if !report.is_sound() {
            diags.warn(format!(
                "stripe {name}: {} cycles, {} cross-linked entries",
                report.cycles, report.cross_linked
            ));
        }
    }
    Ok(diags)
}

pub fn check_freelists<A: Access>(
    cache: &mut Cache<A>,
    device: Option<&Path>,
) -> Result<(Diagnostics, Vec<StripeRef>)> {
    let mut diags = Diagnostics::new();
    let mut repaired = Vec::new();
    for (r, name, report) in outcomes(cache.check_freelists(device)?, &mut diags) {
        let total: usize = report.lengths.iter().sum();
        println!("{name}: {total} free entries in {} segments", report.lengths.len());
        if !report.repaired.is_empty() {
            for cycle in report.cycles() {
                diags.warn(format!("stripe {name}: {cycle}, segment reinitialized"));
            }
            repaired.push(r);
        }
    }
    Ok((diags, repaired))
}

pub fn walk_bucket_chains<A: Access>(
    cache: &mut Cache<A>,
    device: Option<&Path>,
) -> Result<(Diagnostics, Vec<StripeRef>)> {
    let mut diags = Diagnostics::new();
    let mut repaired = Vec::new();
    for (r, name, report) in outcomes(cache.walk_bucket_chains(device)?, &mut diags) {
        println!("{name}: {} entries cleaned", report.cleaned);
        for cycle in report.cycles() {
            diags.warn(format!("stripe {name}: {cycle}, segment reinitialized"));
        }
        if report.changed() {
            repaired.push(r);
        }
    }
    Ok((diags, repaired))
}

pub fn find<A: Access>(cache: &Cache<A>, urls: &[String]) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for url in urls {
        match cache.find(url) {
            Ok((key, r)) => {
                let name = cache.stripe(r).map_or("?", |s| s.hash_text());
                println!("{url} {key} -> {name}");
            }
            Err(e) => diags.fatal(format!("{url}: {e}")),
        }
    }
    diags
}

pub fn retrieve<A: Access>(cache: &mut Cache<A>, urls: &[String]) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for url in urls {
        match cache.retrieve(url) {
            Ok(hit) => match &hit.fragment {
                Some(f) => {
                    let preview = &f.data()[..f.data().len().min(32)];
                    println!(
                        "{url} {}: {} bytes of {} (header {} bytes){} data {}",
                        hit.key,
                        f.data().len(),
                        f.doc.total_len,
                        f.header().len(),
                        if f.is_complete() { "" } else { ", truncated" },
                        hex::encode(preview)
                    );
                }
                None => println!("{url} {}: not cached", hit.key),
            },
            Err(e) => diags.fatal(format!("{url}: {e}")),
        }
    }
    diags
}

pub fn scan<A: Access>(cache: &mut Cache<A>, json: bool) -> Result<Diagnostics> {
    let reports = cache.scan();
    let mut diags = Diagnostics::new();
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    let mut total = StripeBlocks::new(0);
    for r in &reports {
        if let Some(stripe) = cache.stripe(r.stripe_ref()) {
            total += credited(stripe.len());
        }
        if !json {
            println!(
                "{}: {} entries, {} good docs, {} bad, {} bytes",
                r.name, r.entries, r.docs_ok, r.docs_bad, r.bytes
            );
        }
        if let Some(e) = &r.error {
            diags.warn(format!("stripe {}: {e}", r.name));
        }
        if r.docs_bad > 0 {
            diags.warn(format!("stripe {}: {} unreadable fragments", r.name, r.docs_bad));
        }
    }
    if !json {
        println!("Scanned {} stripes, {total}", reports.len());
    }
    Ok(diags)
}
