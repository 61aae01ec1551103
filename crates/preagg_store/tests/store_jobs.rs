use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tempfile::tempdir;

use preagg_store::{
    Clock, CreateOutcome, JobRepository, JobStatus, ManualClock, PreaggConfig, PreaggResult,
    PreaggStore, TeamId, TimeRange, TransitionFields,
};

const HASH_A: &str = "a9f2c77d0b1e44e5a6d3c2b1908f7e6d5c4b3a291817161514131211100f0e0d";
const HASH_B: &str = "b0e1d2c3b4a5968778695a4b3c2d1e0ff0e1d2c3b4a5968778695a4b3c2d1e0f";

async fn open_store(
    base: &std::path::Path,
    clock: Arc<ManualClock>,
) -> PreaggResult<PreaggStore> {
    let config = PreaggConfig::default_sqlite(base.join("jobs.sqlite").to_string_lossy());
    PreaggStore::connect(&config, base, clock).await
}

fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap(),
    ))
}

fn day_range(day: u32, days: i64) -> TimeRange {
    let start = Utc.with_ymd_and_hms(2025, 6, day, 0, 0, 0).unwrap();
    TimeRange::new(start, start + Duration::days(days))
}

#[tokio::test]
async fn create_claims_a_range_exactly_once() -> PreaggResult<()> {
    let dir = tempdir().expect("tempdir");
    let clock = test_clock();
    let store = open_store(dir.path(), clock.clone()).await?;
    let team = TeamId(1);
    let range = day_range(1, 1);

    let first = store.create(team, HASH_A, range, 3_600).await?;
    let job = match first {
        CreateOutcome::Created(job) => job,
        CreateOutcome::AlreadyClaimed => panic!("first create must win the claim"),
    };
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.expires_at, clock.now() + Duration::seconds(3_600));

    let second = store.create(team, HASH_A, range, 3_600).await?;
    assert!(matches!(second, CreateOutcome::AlreadyClaimed));
    Ok(())
}

#[tokio::test]
async fn concurrent_creates_yield_one_winner() -> PreaggResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path(), test_clock()).await?;
    let team = TeamId(1);
    let range = day_range(2, 1);

    let (left, right) = tokio::join!(
        store.create(team, HASH_A, range, 3_600),
        store.create(team, HASH_A, range, 3_600),
    );
    let outcomes = [left?, right?];
    let created = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, CreateOutcome::Created(_)))
        .count();
    assert_eq!(created, 1);
    Ok(())
}

#[tokio::test]
async fn different_hashes_do_not_contend() -> PreaggResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path(), test_clock()).await?;
    let team = TeamId(1);
    let range = day_range(3, 1);

    assert!(matches!(
        store.create(team, HASH_A, range, 3_600).await?,
        CreateOutcome::Created(_)
    ));
    assert!(matches!(
        store.create(team, HASH_B, range, 3_600).await?,
        CreateOutcome::Created(_)
    ));
    assert!(matches!(
        store.create(TeamId(2), HASH_A, range, 3_600).await?,
        CreateOutcome::Created(_)
    ));
    Ok(())
}

#[tokio::test]
async fn transition_applies_exactly_once() -> PreaggResult<()> {
    let dir = tempdir().expect("tempdir");
    let clock = test_clock();
    let store = open_store(dir.path(), clock.clone()).await?;
    let team = TeamId(1);
    let range = day_range(4, 1);

    let job = match store.create(team, HASH_A, range, 3_600).await? {
        CreateOutcome::Created(job) => job,
        CreateOutcome::AlreadyClaimed => panic!("claim expected"),
    };

    let applied = store
        .transition_if_status(
            job.id,
            JobStatus::Pending,
            JobStatus::Ready,
            TransitionFields::computed_at(clock.now()),
        )
        .await?;
    assert!(applied);

    // A peer racing the same transition loses.
    let applied_again = store
        .transition_if_status(
            job.id,
            JobStatus::Pending,
            JobStatus::Failed,
            TransitionFields::error("too late"),
        )
        .await?;
    assert!(!applied_again);

    let found = store.find_existing(team, HASH_A, range).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].status, JobStatus::Ready);
    assert_eq!(found[0].computed_at, Some(clock.now()));
    Ok(())
}

#[tokio::test]
async fn terminal_transition_frees_the_claim() -> PreaggResult<()> {
    let dir = tempdir().expect("tempdir");
    let clock = test_clock();
    let store = open_store(dir.path(), clock.clone()).await?;
    let team = TeamId(1);
    let range = day_range(5, 1);

    let job = match store.create(team, HASH_A, range, 3_600).await? {
        CreateOutcome::Created(job) => job,
        CreateOutcome::AlreadyClaimed => panic!("claim expected"),
    };
    store
        .transition_if_status(
            job.id,
            JobStatus::Pending,
            JobStatus::Ready,
            TransitionFields::computed_at(clock.now()),
        )
        .await?;

    // With the first job terminal, the same range can be claimed again and
    // both rows coexist.
    assert!(matches!(
        store.create(team, HASH_A, range, 3_600).await?,
        CreateOutcome::Created(_)
    ));
    let found = store.find_existing(team, HASH_A, range).await?;
    assert_eq!(found.len(), 2);
    Ok(())
}

#[tokio::test]
async fn failed_jobs_are_invisible_to_lookup() -> PreaggResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path(), test_clock()).await?;
    let team = TeamId(1);
    let range = day_range(6, 1);

    let job = match store.create(team, HASH_A, range, 3_600).await? {
        CreateOutcome::Created(job) => job,
        CreateOutcome::AlreadyClaimed => panic!("claim expected"),
    };
    store
        .transition_if_status(
            job.id,
            JobStatus::Pending,
            JobStatus::Failed,
            TransitionFields::error("boom"),
        )
        .await?;

    assert!(store.find_existing(team, HASH_A, range).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn expired_jobs_are_invisible_to_lookup() -> PreaggResult<()> {
    let dir = tempdir().expect("tempdir");
    let clock = test_clock();
    let store = open_store(dir.path(), clock.clone()).await?;
    let team = TeamId(1);
    let range = day_range(7, 1);

    store.create(team, HASH_A, range, 900).await?;
    assert_eq!(store.find_existing(team, HASH_A, range).await?.len(), 1);

    clock.advance(Duration::seconds(901));
    assert!(store.find_existing(team, HASH_A, range).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn lookup_returns_overlaps_ordered_by_start() -> PreaggResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path(), test_clock()).await?;
    let team = TeamId(1);

    // Insert out of order; one range sits outside the queried window.
    store.create(team, HASH_A, day_range(20, 1), 86_400).await?;
    store.create(team, HASH_A, day_range(12, 1), 86_400).await?;
    store.create(team, HASH_A, day_range(14, 2), 86_400).await?;

    let queried = TimeRange::new(
        Utc.with_ymd_and_hms(2025, 6, 12, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 6, 16, 0, 0, 0).unwrap(),
    );
    let found = store.find_existing(team, HASH_A, queried).await?;
    assert_eq!(found.len(), 2);
    assert!(found[0].range.start < found[1].range.start);
    assert_eq!(found[0].range, day_range(12, 1));
    assert_eq!(found[1].range, day_range(14, 2));
    Ok(())
}
