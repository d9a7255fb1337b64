//! A cluster of five nodes must apply every committed entry in the same
//! order on every member, and the state each ends up with must match.

mod fixtures;

use std::sync::Arc;

use fixtures::ClientRequest;
use fixtures::RaftRouter;
use maplit::btreeset;
use raft_core::Config;
use raft_core::NodeRole;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn total_order_apply() -> anyhow::Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));

    for id in 0..3 {
        router.new_raft_node(id).await?;
    }

    router.initialize_from_single_node(0).await?;
    router.wait_for_log(&[0], 1, None).await?;
    router.wait_for_state(&[0], NodeRole::Leader, None).await?;

    for id in 1..3 {
        router.add_learner(0, id).await?;
    }
    router.wait_for_log(&[0, 1, 2], 1, None).await?;
    router.change_membership(0, btreeset! {0, 1, 2}).await?;
    router.wait_for_log(&[0, 1, 2], 2, None).await?;

    let leader = router.leader().await.expect("cluster has a leader");
    router.client_write_many(leader, "client-a", 20).await;

    let expected_index = 2 + 20;
    router.wait_for_applied(&[0, 1, 2], expected_index, None).await?;

    let mut last_status = None;
    for id in 0..3 {
        let store = router.get_state_machine(id).await;
        let status = store.get("client-a").await;
        assert!(status.is_some(), "node {} has no recorded status for client-a", id);
        match &last_status {
            None => last_status = Some(status),
            Some(prev) => assert_eq!(*prev, status, "node {} diverged from its peers", id),
        }
    }
    assert_eq!(last_status.unwrap().unwrap(), "request-19");

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retried_write_is_applied_once() -> anyhow::Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    router.new_raft_node(0).await?;
    router.initialize_from_single_node(0).await?;
    router.wait_for_state(&[0], NodeRole::Leader, None).await?;

    let first = router.client_write(0, ClientRequest::new("dup-client", 7, "first")).await;
    let retry = router.client_write(0, ClientRequest::new("dup-client", 7, "second")).await;

    assert_eq!(first, retry, "a replayed serial must return the same response, not apply twice");

    let store = router.get_state_machine(0).await;
    assert_eq!(store.get("dup-client").await.unwrap(), "first");

    Ok(())
}
