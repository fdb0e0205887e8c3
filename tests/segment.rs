#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::{assert_matches, assert_none, assert_some};
use dispatch::segment::{self, SegmentState};
use dispatch::{setup_database, TransitionError};
use sqlx::PgPool;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

mod test_utils {
    use super::*;
    use std::sync::Once;
    use testcontainers::runners::AsyncRunner;

    static TRACING: Once = Once::new();

    /// Log to the test writer; filter with `RUST_LOG` as usual.
    pub(super) fn init_tracing() {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        init_tracing();
        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }
}

#[tokio::test]
async fn segments_walk_the_pipeline_in_order() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let created = segment::create(&pool, 3).await?;
    assert_eq!(created.state, SegmentState::Queued);
    assert_eq!(created.retry_count, 0);

    let path = [
        SegmentState::Retrieving,
        SegmentState::Generating,
        SegmentState::Rendering,
        SegmentState::Normalizing,
        SegmentState::Ready,
        SegmentState::Airing,
        SegmentState::Aired,
        SegmentState::Archived,
    ];
    for to in path {
        let updated = segment::transition(&pool, created.id, to).await?;
        assert_eq!(updated.state, to);
    }

    Ok(())
}

#[tokio::test]
async fn skipped_stages_are_rejected_and_leave_state_unchanged() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let created = segment::create(&pool, 3).await?;

    let result = segment::transition(&pool, created.id, SegmentState::Ready).await;
    assert_matches!(
        result,
        Err(TransitionError::InvalidTransition {
            from: SegmentState::Queued,
            to: SegmentState::Ready,
        })
    );

    let current = segment::get(&pool, created.id).await?;
    assert_eq!(current.state, SegmentState::Queued);

    Ok(())
}

#[tokio::test]
async fn archived_is_terminal() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let created = segment::create(&pool, 3).await?;
    sqlx::query("UPDATE segments SET state = 'archived' WHERE id = $1")
        .bind(created.id)
        .execute(&pool)
        .await?;

    let result = segment::transition(&pool, created.id, SegmentState::Queued).await;
    assert_matches!(result, Err(TransitionError::InvalidTransition { .. }));

    Ok(())
}

#[tokio::test]
async fn failed_segments_retry_until_the_budget_is_spent() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let created = segment::create(&pool, 2).await?;
    segment::transition(&pool, created.id, SegmentState::Retrieving).await?;

    // First failure and retry.
    let failed = segment::mark_failed(&pool, created.id, "no sources found").await?;
    assert_eq!(failed.state, SegmentState::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("no sources found"));

    let retried = segment::transition(&pool, created.id, SegmentState::Queued).await?;
    assert_eq!(retried.state, SegmentState::Queued);
    assert_eq!(retried.retry_count, 1);
    assert_none!(retried.last_error);

    // Second failure and retry exhausts the budget of 2.
    segment::transition(&pool, created.id, SegmentState::Retrieving).await?;
    segment::mark_failed(&pool, created.id, "no sources found").await?;
    let retried = segment::transition(&pool, created.id, SegmentState::Queued).await?;
    assert_eq!(retried.retry_count, 2);

    segment::transition(&pool, created.id, SegmentState::Retrieving).await?;
    segment::mark_failed(&pool, created.id, "no sources found").await?;
    let result = segment::transition(&pool, created.id, SegmentState::Queued).await;
    assert_matches!(
        result,
        Err(TransitionError::RetryLimitExceeded {
            retry_count: 2,
            max_retries: 2,
            ..
        })
    );

    // The rejected retry left the segment untouched.
    let current = segment::get(&pool, created.id).await?;
    assert_eq!(current.state, SegmentState::Failed);
    assert_eq!(current.retry_count, 2);
    assert_some!(current.last_error);

    Ok(())
}

#[tokio::test]
async fn failure_is_only_reachable_mid_pipeline() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    // A queued segment has not started any stage; it cannot fail.
    let created = segment::create(&pool, 3).await?;
    let result = segment::mark_failed(&pool, created.id, "nope").await;
    assert_matches!(result, Err(TransitionError::InvalidTransition { .. }));

    Ok(())
}

#[tokio::test]
async fn unknown_segments_are_reported() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let result = segment::transition(&pool, 42, SegmentState::Retrieving).await;
    assert_matches!(result, Err(TransitionError::SegmentNotFound(42)));

    Ok(())
}

#[tokio::test]
async fn concurrent_transitions_serialize_to_one_winner() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let created = segment::create(&pool, 3).await?;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        let id = created.id;
        tasks.push(tokio::spawn(async move {
            segment::transition(&pool, id, SegmentState::Retrieving).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await?.is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one concurrent transition may apply");

    let current = segment::get(&pool, created.id).await?;
    assert_eq!(current.state, SegmentState::Retrieving);

    Ok(())
}
