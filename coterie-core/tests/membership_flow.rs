#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use coterie_core::transport::memory::InProcessMesh;
use coterie_core::{
    HINTS_KEY, JoinRequest, MemberState, MembershipConfig, MembershipError, MembershipEvent,
    MembershipService, NodeEntry, NodeId, OptionValue, Options,
};

const CONVERGENCE_DEADLINE: Duration = Duration::from_secs(5);

struct TestNode {
    service: MembershipService,
    task: JoinHandle<()>,
    _data_dir: tempfile::TempDir,
}

impl TestNode {
    async fn stop(self) {
        self.service.stop().await;
        let _ = self.task.await;
    }
}

fn node(id: &str) -> NodeId {
    NodeId::from(id)
}

fn entry(position: u64, id: &str) -> NodeEntry {
    NodeEntry::bare(position, node(id))
}

async fn start_node(mesh: &InProcessMesh, id: &str) -> TestNode {
    start_node_with(mesh, id, false).await
}

async fn start_node_with(mesh: &InProcessMesh, id: &str, test_mode: bool) -> TestNode {
    let (transport, inbound) = mesh.join(node(id));
    let data_dir = tempfile::tempdir().expect("tempdir");
    let config = MembershipConfig {
        node: node(id),
        data_dir: data_dir.path().to_path_buf(),
        test: test_mode,
        ..MembershipConfig::default()
    };
    let (service, task) = MembershipService::spawn(config, Arc::new(transport), inbound).await;
    TestNode {
        service,
        task,
        _data_dir: data_dir,
    }
}

async fn states_of(nodes: &[&TestNode]) -> Vec<MemberState> {
    let mut states = Vec::with_capacity(nodes.len());
    for node in nodes {
        states.push(node.service.state().await.expect("state"));
    }
    states
}

async fn wait_for_convergence(nodes: &[&TestNode]) -> MemberState {
    let deadline = Instant::now() + CONVERGENCE_DEADLINE;
    loop {
        let states = states_of(nodes).await;
        if states.windows(2).all(|pair| pair[0].same_view(&pair[1])) {
            return states.into_iter().next().expect("at least one node");
        }
        assert!(
            Instant::now() < deadline,
            "cluster did not converge in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn expect_event(
    events: &mut broadcast::Receiver<MembershipEvent>,
    expected: &MembershipEvent,
) {
    let deadline = Instant::now() + CONVERGENCE_DEADLINE;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_else(|| panic!("event {expected:?} not observed"));
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if &event == expected => return,
            Ok(Ok(_)) => {}
            _ => panic!("event {expected:?} not observed"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn single_node_init_seeds_the_ring() {
    let mesh = InProcessMesh::new();
    let n1 = start_node(&mesh, "n1").await;
    let mut events = n1.service.subscribe();

    n1.service
        .join(JoinRequest::Init {
            entries: vec![entry(1, "n1")],
        })
        .await
        .expect("init");

    assert_eq!(n1.service.nodes().await.expect("nodes"), vec![node("n1")]);
    let clock = n1.service.clock().await.expect("clock");
    assert_eq!(clock.get(&node("n1")), 1);
    assert_eq!(clock.len(), 1);
    expect_event(&mut events, &MembershipEvent::NodeJoin(node("n1"))).await;

    n1.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn join_via_ping_converges_two_nodes() {
    let mesh = InProcessMesh::new();
    let n1 = start_node(&mesh, "n1").await;
    let n2 = start_node(&mesh, "n2").await;

    n1.service
        .join(JoinRequest::Init {
            entries: vec![entry(1, "n1")],
        })
        .await
        .expect("init");
    n2.service
        .join(JoinRequest::Join {
            entries: vec![entry(2, "n2")],
            ping: node("n1"),
        })
        .await
        .expect("join");

    let state = wait_for_convergence(&[&n1, &n2]).await;
    assert_eq!(
        state.ring.entries().to_vec(),
        vec![entry(1, "n1"), entry(2, "n2")]
    );
    assert_eq!(state.clock.get(&node("n1")), 1);
    assert_eq!(state.clock.get(&node("n2")), 1);

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn occupied_position_rejects_the_join() {
    let mesh = InProcessMesh::new();
    let n1 = start_node(&mesh, "n1").await;
    let n2 = start_node(&mesh, "n2").await;

    n1.service
        .join(JoinRequest::Init {
            entries: vec![entry(1, "n1")],
        })
        .await
        .expect("init");

    let err = n2
        .service
        .join(JoinRequest::Join {
            entries: vec![entry(1, "n2")],
            ping: node("n1"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MembershipError::PositionExists(1)));

    // both sides keep their previous state
    assert!(n2.service.nodes().await.expect("nodes").is_empty());
    assert_eq!(n1.service.nodes().await.expect("nodes"), vec![node("n1")]);
    assert_eq!(n1.service.clock().await.expect("clock").get(&node("n1")), 1);

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn readding_a_member_is_rejected() {
    let mesh = InProcessMesh::new();
    let n1 = start_node(&mesh, "n1").await;
    let n2 = start_node(&mesh, "n2").await;

    n1.service
        .join(JoinRequest::Init {
            entries: vec![entry(1, "n1")],
        })
        .await
        .expect("init");

    let err = n2
        .service
        .join(JoinRequest::Join {
            entries: vec![entry(1, "n1")],
            ping: node("n1"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MembershipError::NodeExistsAtPosition(1)));

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn replace_takes_over_the_slot() {
    let mesh = InProcessMesh::new();
    let n1 = start_node(&mesh, "n1").await;
    let n2 = start_node(&mesh, "n2").await;

    n1.service
        .join(JoinRequest::Init {
            entries: vec![entry(1, "n1")],
        })
        .await
        .expect("init");
    n2.service
        .join(JoinRequest::Join {
            entries: vec![entry(2, "n2")],
            ping: node("n1"),
        })
        .await
        .expect("join");
    wait_for_convergence(&[&n1, &n2]).await;

    let n3 = start_node(&mesh, "n3").await;
    let mut events = n3.service.subscribe();
    let mut options = Options::new();
    options.insert(
        HINTS_KEY.to_string(),
        OptionValue::List(vec!["p0".to_string()]),
    );
    n3.service
        .join(JoinRequest::Replace {
            old: node("n1"),
            options,
            ping: node("n2"),
        })
        .await
        .expect("replace");

    expect_event(&mut events, &MembershipEvent::NodeLeave(node("n1"))).await;

    let full = n3.service.full_nodes().await.expect("full nodes");
    assert_eq!(full.len(), 2);
    assert_eq!(full[0].position, 1);
    assert_eq!(full[0].node, node("n3"));
    assert_eq!(full[0].hints(), Some(&["p0".to_string()][..]));
    assert_eq!(full[1], entry(2, "n2"));

    let state = wait_for_convergence(&[&n2, &n3]).await;
    assert_eq!(
        state.ring.node_ids(),
        vec![node("n3"), node("n2")]
    );

    n1.stop().await;
    n2.stop().await;
    n3.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn leave_removes_the_member() {
    let mesh = InProcessMesh::new();
    let n1 = start_node(&mesh, "n1").await;
    let n2 = start_node(&mesh, "n2").await;
    let n3 = start_node(&mesh, "n3").await;

    n1.service
        .join(JoinRequest::Init {
            entries: vec![entry(1, "n1")],
        })
        .await
        .expect("init");
    n2.service
        .join(JoinRequest::Join {
            entries: vec![entry(2, "n2")],
            ping: node("n1"),
        })
        .await
        .expect("join n2");
    n3.service
        .join(JoinRequest::Join {
            entries: vec![entry(3, "n3")],
            ping: node("n2"),
        })
        .await
        .expect("join n3");
    wait_for_convergence(&[&n1, &n2, &n3]).await;

    let mut events = n1.service.subscribe();
    let clock_before = n1.service.clock().await.expect("clock");
    n1.service
        .join(JoinRequest::Leave { node: node("n3") })
        .await
        .expect("leave");

    expect_event(&mut events, &MembershipEvent::NodeLeave(node("n3"))).await;
    assert_eq!(
        n1.service.nodes().await.expect("nodes"),
        vec![node("n1"), node("n2")]
    );
    let clock_after = n1.service.clock().await.expect("clock");
    assert_eq!(
        clock_after.get(&node("n1")),
        clock_before.get(&node("n1")) + 1
    );

    let state = wait_for_convergence(&[&n1, &n2]).await;
    assert_eq!(state.ring.node_ids(), vec![node("n1"), node("n2")]);

    // leaving an unknown node still acknowledges and emits the event
    n1.service
        .join(JoinRequest::Leave { node: node("ghost") })
        .await
        .expect("leave unknown");

    n1.stop().await;
    n2.stop().await;
    n3.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn states_groups_members_by_agreement() {
    let mesh = InProcessMesh::new();
    let n1 = start_node(&mesh, "n1").await;
    let n2 = start_node(&mesh, "n2").await;

    n1.service
        .join(JoinRequest::Init {
            entries: vec![entry(1, "n1")],
        })
        .await
        .expect("init");
    n2.service
        .join(JoinRequest::Join {
            entries: vec![entry(2, "n2")],
            ping: node("n1"),
        })
        .await
        .expect("join");
    wait_for_convergence(&[&n1, &n2]).await;

    // a connected process that never joined the ring
    let (_outsider, _outsider_rx) = mesh.join(node("n9"));

    let states = n1.service.states().await.expect("states");
    assert_eq!(states.groups.len(), 1);
    let mut group_nodes = states.groups[0].nodes.clone();
    group_nodes.sort();
    assert_eq!(group_nodes, vec![node("n1"), node("n2")]);
    assert!(states.bad_nodes.is_empty());
    assert_eq!(states.non_member_nodes, vec![node("n9")]);

    mesh.set_down(&node("n2"));
    let states = n1.service.states().await.expect("states");
    assert_eq!(states.bad_nodes, vec![node("n2")]);
    assert_eq!(states.groups.len(), 1);
    assert_eq!(states.groups[0].nodes, vec![node("n1")]);

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn liveness_events_respect_ring_membership() {
    let mesh = InProcessMesh::new();
    let n1 = start_node(&mesh, "n1").await;
    let n2 = start_node(&mesh, "n2").await;

    n1.service
        .join(JoinRequest::Init {
            entries: vec![entry(1, "n1")],
        })
        .await
        .expect("init");
    n2.service
        .join(JoinRequest::Join {
            entries: vec![entry(2, "n2")],
            ping: node("n1"),
        })
        .await
        .expect("join");
    wait_for_convergence(&[&n1, &n2]).await;

    let mut events = n1.service.subscribe();

    // a non-member coming up is not announced
    let (_outsider, _outsider_rx) = mesh.join(node("n9"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = events.try_recv() {
        assert_ne!(event, MembershipEvent::NodeUp(node("n9")));
    }

    // a member going down is always announced, coming back is announced too
    mesh.set_down(&node("n2"));
    expect_event(&mut events, &MembershipEvent::NodeDown(node("n2"))).await;
    mesh.set_up(&node("n2"));
    expect_event(&mut events, &MembershipEvent::NodeUp(node("n2"))).await;

    // a non-member going down is still announced
    mesh.set_down(&node("n9"));
    expect_event(&mut events, &MembershipEvent::NodeDown(node("n9"))).await;

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn reset_is_gated_on_test_mode() {
    let mesh = InProcessMesh::new();

    let test_node = start_node_with(&mesh, "t1", true).await;
    test_node
        .service
        .join(JoinRequest::Init {
            entries: vec![entry(1, "t1")],
        })
        .await
        .expect("init");
    assert_eq!(test_node.service.nodes().await.expect("nodes").len(), 1);
    test_node.service.reset().await.expect("reset");
    assert!(test_node.service.nodes().await.expect("nodes").is_empty());

    let production_node = start_node(&mesh, "p1").await;
    let err = production_node.service.reset().await.unwrap_err();
    assert!(matches!(err, MembershipError::NotReset));

    test_node.stop().await;
    production_node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn test_mode_joins_use_the_local_state() {
    let mesh = InProcessMesh::new();
    let t1 = start_node_with(&mesh, "t1", true).await;

    t1.service
        .join(JoinRequest::Init {
            entries: vec![entry(1, "t1")],
        })
        .await
        .expect("init");
    // the ping node is never contacted in test mode
    t1.service
        .join(JoinRequest::Join {
            entries: vec![entry(2, "t2")],
            ping: node("absent"),
        })
        .await
        .expect("join");

    assert_eq!(
        t1.service.nodes().await.expect("nodes"),
        vec![node("t1"), node("t2")]
    );

    t1.stop().await;
}
