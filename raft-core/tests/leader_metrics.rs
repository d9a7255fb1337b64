//! Leader-side replication metrics must track the cluster's actual shape:
//! they appear once a follower is added, converge to its matched index, and
//! disappear once the follower is removed.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::RaftRouter;
use maplit::btreeset;
use raft_core::Config;
use raft_core::NodeRole;

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn leader_metrics_track_cluster_shape() -> anyhow::Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));

    for id in 0..5 {
        router.new_raft_node(id).await?;
    }

    router.initialize_from_single_node(0).await?;
    router.wait_for_state(&[0], NodeRole::Leader, None).await?;

    for id in 1..5 {
        router.add_learner(0, id).await?;
    }
    router.wait_for_log(&[0, 1, 2, 3, 4], 1, None).await?;

    router.change_membership(0, btreeset! {0, 1, 2, 3, 4}).await?;
    router.wait_for_log(&[0, 1, 2, 3, 4], 2, None).await?;

    router.client_write_many(0, "client-a", 10).await;
    let expected_index = 2 + 10;
    router.wait_for_applied(&[0, 1, 2, 3, 4], expected_index, None).await?;

    router
        .wait(0, Some(Duration::from_secs(5)))
        .await?
        .metrics(|m| {
            let Some(leader) = &m.leader_metrics else { return false };
            [1u64, 2, 3, 4].iter().all(|id| leader.replication.get(id).map(|r| r.matched.index) == Some(expected_index))
        })
        .await?;

    router.change_membership(0, btreeset! {0, 1, 2, 3}).await?;
    router.wait_for_state(&[4], NodeRole::Follower, None).await?;

    router
        .wait(0, Some(Duration::from_secs(5)))
        .await?
        .metrics(|m| {
            let Some(leader) = &m.leader_metrics else { return false };
            leader.replication.len() == 3 && !leader.replication.contains_key(&4)
        })
        .await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_vote_with_higher_term_forces_step_down() -> anyhow::Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    router.new_raft_node(0).await?;
    router.initialize_from_single_node(0).await?;
    router.wait_for_state(&[0], NodeRole::Leader, None).await?;

    let resp = raft_core::ClientService::vote(
        &*router,
        0,
        raft_core::raft::VoteRequest::new(100, 99, raft_core::LogId::none()),
    )
    .await?;
    assert!(resp.vote_granted, "a higher term from an unknown candidate should still be granted with no competing log");

    router.wait_for_state(&[0], NodeRole::Candidate, None).await?;

    router
        .wait(0, Some(Duration::from_secs(5)))
        .await?
        .metrics(|m| m.leader_metrics.is_none())
        .await?;

    Ok(())
}
