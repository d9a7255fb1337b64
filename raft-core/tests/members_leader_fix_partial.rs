//! `change_membership` appends the joint and final configuration entries
//! back to back in the same call (see `core::admin::ConfigTransition`), so
//! there is never a restart window where a node's persisted log holds a
//! joint entry with no following final entry. This asserts that
//! invariant holds end to end: once `change_membership` returns, every
//! member's committed configuration is already the uniform target, not
//! the intermediate joint one.

mod fixtures;

use std::sync::Arc;

use fixtures::RaftRouter;
use maplit::btreeset;
use raft_core::Config;
use raft_core::NodeRole;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn change_membership_never_leaves_a_joint_config_committed() -> anyhow::Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));

    for id in 0..3 {
        router.new_raft_node(id).await?;
    }
    router.initialize_from_single_node(0).await?;
    router.wait_for_state(&[0], NodeRole::Leader, None).await?;

    router.add_learner(0, 1).await?;
    router.add_learner(0, 2).await?;
    router.wait_for_log(&[0, 1, 2], 1, None).await?;

    router.change_membership(0, btreeset! {0, 1, 2}).await?;

    for id in [0u64, 1, 2] {
        let metrics = router.wait(id, None).await?.metrics(|_| true).await?;
        assert!(!metrics.membership_config.is_joint(), "node {} is still in joint config after change_membership returned", id);
        assert_eq!(metrics.membership_config.members, btreeset! {0, 1, 2});
    }

    Ok(())
}
