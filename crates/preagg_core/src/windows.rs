//! Range and coverage arithmetic over day-aligned windows.

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::{Job, JobStatus, TimeRange, TtlSchedule};

fn day_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Ordered, non-overlapping day windows covering `[start, end)`. A
/// non-midnight `end` pulls in that day in full.
pub fn daily_windows(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimeRange> {
    let mut windows = Vec::new();
    if start >= end {
        return windows;
    }
    let mut day = day_floor(start);
    while day < end {
        let next = day + Duration::days(1);
        windows.push(TimeRange::new(day, next));
        day = next;
    }
    windows
}

/// Daily windows of `[start, end)` not fully contained by any `Ready` or
/// `Pending` job, merged into maximal contiguous ranges, ascending.
pub fn missing_windows(jobs: &[Job], start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimeRange> {
    let mut missing: Vec<TimeRange> = Vec::new();
    for window in daily_windows(start, end) {
        let covered = jobs.iter().any(|job| {
            matches!(job.status, JobStatus::Ready | JobStatus::Pending)
                && job.range.contains(&window)
        });
        if covered {
            continue;
        }
        match missing.last_mut() {
            Some(last) if last.end == window.start => last.end = window.end,
            _ => missing.push(window),
        }
    }
    missing
}

/// Re-expands each range into daily windows, tags each window with its TTL,
/// and merges consecutive windows sharing one. No output range spans two TTL
/// regimes, so a single `expires_at` is valid for the whole range.
pub fn split_by_ttl(ranges: &[TimeRange], schedule: &TtlSchedule) -> Vec<(TimeRange, u64)> {
    let mut out: Vec<(TimeRange, u64)> = Vec::new();
    for range in ranges {
        for window in daily_windows(range.start, range.end) {
            let ttl = schedule.ttl_for(window.start);
            match out.last_mut() {
                Some((last, last_ttl)) if last.end == window.start && *last_ttl == ttl => {
                    last.end = window.end;
                }
                _ => out.push((window, ttl)),
            }
        }
    }
    out
}

/// Drops jobs whose materialization can no longer be trusted. `Pending` jobs
/// always pass; `Ready` jobs pass only while `created_at` plus the TTL the
/// *caller's* schedule assigns to their range start is not behind `now`. A
/// reader with a stricter schedule thereby rejects a writer's generous TTL.
pub fn filter_by_freshness(jobs: Vec<Job>, schedule: &TtlSchedule, now: DateTime<Utc>) -> Vec<Job> {
    jobs.into_iter()
        .filter(|job| match job.status {
            JobStatus::Pending => true,
            JobStatus::Ready => {
                let ttl = Duration::seconds(schedule.ttl_for(job.range.start) as i64);
                job.created_at + ttl >= now
            }
            JobStatus::Failed => false,
        })
        .collect()
}

/// Resolves overlapping `Ready` coverage left behind by races: newest first,
/// greedily keeping jobs that do not overlap anything already kept. Output is
/// ordered by range start.
pub fn filter_overlapping_jobs(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.0.cmp(&b.id.0))
    });
    let mut kept: Vec<Job> = Vec::new();
    for job in jobs {
        if kept.iter().all(|existing| !existing.range.overlaps(&job.range)) {
            kept.push(job);
        }
    }
    kept.sort_by(|a, b| a.range.start.cmp(&b.range.start));
    kept
}
