use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::chunked::RemoteChunkedReader;
use crate::config::ScanContext;
use crate::dispatch::{ScanDispatcher, ScanJob};
use crate::model::{ScanTarget, TargetReport};
use crate::walk::ExcludeMatcher;

/// Scans every object in `bucket`. Listing runs on the calling thread while
/// workers scan; the dispatcher is only drained once listing ends.
pub fn scan_bucket(context: &ScanContext, bucket: &str) -> TargetReport {
    let started = Instant::now();
    let target = ScanTarget::Bucket(bucket.to_string());
    let mut report = TargetReport::new(target.clone());
    let settings = &context.settings;
    let excludes = ExcludeMatcher::new(&settings.excludes);

    info!("scanning bucket {}", bucket);
    let dispatcher = ScanDispatcher::start(
        Arc::clone(&context.engine),
        target,
        &settings.dispatch_options(),
    );

    let mut token: Option<String> = None;
    let mut pages = 0_u64;
    let listing = loop {
        let page = match context.object_storage.list_objects(bucket, token.as_deref()) {
            Ok(page) => page,
            Err(err) => break Err(err.to_string()),
        };
        pages += 1;
        debug!(
            "bucket {} page {}: {} object(s)",
            bucket,
            pages,
            page.objects.len()
        );

        let mut closed = false;
        for object in page.objects {
            if excludes.is_excluded_key(&object.key) {
                report.subjects_skipped += 1;
                continue;
            }
            let reader = RemoteChunkedReader::new(
                Arc::clone(&context.object_storage),
                bucket,
                object.key,
                object.size,
                settings.chunk_size,
            );
            if let Err(err) = dispatcher.submit(ScanJob::Chunked(Box::new(reader))) {
                error!("error scanning: {}", err);
                closed = true;
                break;
            }
        }
        if closed {
            break Err("scan queue closed before listing finished".to_string());
        }

        match page.next_token {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => break Ok(()),
        }
    };

    let summary = dispatcher.drain();
    report.subjects_scanned = summary.jobs;
    report.scan_errors = summary.scan_errors;
    report.suppressed_errors = summary.suppressed;
    report.matches = summary.matches;
    if let Err(message) = listing {
        error!("listing bucket {} failed: {}", bucket, message);
        report.fail(format!("listing bucket {bucket} failed: {message}"));
    }
    report.elapsed_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
    info!(
        "finished scanning bucket {} ({} object(s) over {} page(s))",
        bucket, report.subjects_scanned, pages
    );
    report
}
